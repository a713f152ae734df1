//! Classification of processes within a monitored tree.
//!
//! Classification is a pure function of the executable name and command line,
//! recomputed on every sampling tick since the OS may reuse pids. The rules
//! are an ordered table evaluated top to bottom so that new roles are additive
//! instead of a rewritten dispatcher; the first matching rule wins.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessRole {
    Main,
    Browser,
    Renderer,
    Gpu,
    Webdriver,
    PythonSubprocess,
    Automation,
    Network,
    Other,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessRole::Main => "main",
            ProcessRole::Browser => "browser",
            ProcessRole::Renderer => "renderer",
            ProcessRole::Gpu => "gpu",
            ProcessRole::Webdriver => "webdriver",
            ProcessRole::PythonSubprocess => "python-subprocess",
            ProcessRole::Automation => "automation",
            ProcessRole::Network => "network",
            ProcessRole::Other => "other",
        };
        f.write_str(name)
    }
}

struct RoleRule {
    role: ProcessRole,
    /// Substrings matched against the lowercased executable name.
    name_contains: &'static [&'static str],
    /// Substrings matched against the lowercased command line.
    cmd_contains: &'static [&'static str],
}

impl RoleRule {
    fn matches(&self, name: &str, cmdline: &str) -> bool {
        self.name_contains.iter().any(|token| name.contains(token))
            || self.cmd_contains.iter().any(|token| cmdline.contains(token))
    }
}

lazy_static! {
    /// Ordered rule table. Subprocess-type flags come before browser binary
    /// names so that e.g. a Chromium renderer (name `chrome`, command line
    /// containing `--type=renderer`) is classified as a renderer, not as the
    /// browser itself.
    static ref ROLE_RULES: Vec<RoleRule> = vec![
        RoleRule {
            role: ProcessRole::Webdriver,
            name_contains: &["chromedriver", "geckodriver", "msedgedriver", "safaridriver"],
            cmd_contains: &[],
        },
        RoleRule {
            role: ProcessRole::Gpu,
            name_contains: &[],
            cmd_contains: &["--type=gpu-process"],
        },
        RoleRule {
            role: ProcessRole::Renderer,
            name_contains: &[],
            cmd_contains: &["--type=renderer"],
        },
        RoleRule {
            role: ProcessRole::Network,
            name_contains: &[],
            cmd_contains: &["network.mojom.networkservice", "--type=network"],
        },
        RoleRule {
            role: ProcessRole::Browser,
            name_contains: &[
                "chromium",
                "chrome",
                "firefox",
                "msedge",
                "webkit",
                "headless_shell",
            ],
            cmd_contains: &[],
        },
        RoleRule {
            role: ProcessRole::Automation,
            name_contains: &[],
            cmd_contains: &["playwright", "puppeteer", "selenium"],
        },
        RoleRule {
            role: ProcessRole::PythonSubprocess,
            name_contains: &["python"],
            cmd_contains: &[],
        },
    ];
}

/// Classifies one process. The root of the monitored tree is always `Main`;
/// anything no rule recognizes is `Other`.
pub fn classify(pid: u32, root_pid: u32, name: &str, cmdline: &str) -> ProcessRole {
    if pid == root_pid {
        return ProcessRole::Main;
    }
    let name = name.to_ascii_lowercase();
    let cmdline = cmdline.to_ascii_lowercase();
    ROLE_RULES
        .iter()
        .find(|rule| rule.matches(&name, &cmdline))
        .map(|rule| rule.role)
        .unwrap_or(ProcessRole::Other)
}
