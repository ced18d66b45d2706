//! 风险分级策略
//!
//! 静态查表：工具身份 + 粗粒度参数形状（命令的程序名与子命令）决定风险等级，调用方无法指定。
//! 命令规则形如 `git` 或 `git push`；`程序 子命令` 规则优先于仅程序名的规则；未命中任何规则时取最严格的 admin。

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::PolicySection;
use crate::core::ActionSuggestion;

/// 风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// 只读 / 检查 / 构建类操作，直接执行
    AutoAllowed,
    /// 破坏性或改变状态，需要确认
    Restricted,
    /// 系统级，需要显式确认口令
    Admin,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::AutoAllowed => "auto_allowed",
            RiskTier::Restricted => "restricted",
            RiskTier::Admin => "admin",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分级策略表
#[derive(Debug, Clone)]
pub struct ActionPolicy {
    /// (程序, 子命令) -> 等级
    subcommands: HashMap<(String, String), RiskTier>,
    /// 程序 -> 等级
    programs: HashMap<String, RiskTier>,
}

impl ActionPolicy {
    pub fn new() -> Self {
        Self {
            subcommands: HashMap::new(),
            programs: HashMap::new(),
        }
    }

    pub fn from_config(cfg: &PolicySection) -> Self {
        let mut policy = Self::new();
        // 后写入的更严格等级覆盖同名规则
        for (rules, tier) in [
            (&cfg.auto_allowed, RiskTier::AutoAllowed),
            (&cfg.restricted, RiskTier::Restricted),
            (&cfg.admin, RiskTier::Admin),
        ] {
            for rule in rules {
                policy = policy.rule(rule, tier);
            }
        }
        policy
    }

    /// 添加规则：`程序` 或 `程序 子命令`
    pub fn rule(mut self, pattern: &str, tier: RiskTier) -> Self {
        let mut parts = pattern.split_whitespace().map(|p| p.to_lowercase());
        match (parts.next(), parts.next()) {
            (Some(program), Some(sub)) => {
                self.subcommands.insert((program, sub), tier);
            }
            (Some(program), None) => {
                self.programs.insert(program, tier);
            }
            _ => {}
        }
        self
    }

    /// 命令白名单：出现在任一规则中的程序
    pub fn allowed_programs(&self) -> HashSet<String> {
        self.programs
            .keys()
            .cloned()
            .chain(self.subcommands.keys().map(|(p, _)| p.clone()))
            .collect()
    }

    pub fn classify(&self, action: &ActionSuggestion) -> RiskTier {
        match action {
            ActionSuggestion::ReadFile { .. }
            | ActionSuggestion::ListDir { .. }
            | ActionSuggestion::CreateFile { .. } => RiskTier::AutoAllowed,
            ActionSuggestion::EditFile { .. } => RiskTier::Restricted,
            ActionSuggestion::RunTerminalCommand { argv } => self.classify_command(argv),
        }
    }

    fn classify_command(&self, argv: &[String]) -> RiskTier {
        let Some(program) = argv.first().map(|p| p.to_lowercase()) else {
            return RiskTier::Admin;
        };
        let sub = argv
            .iter()
            .skip(1)
            .find(|a| !a.starts_with('-'))
            .map(|a| a.to_lowercase());
        if let Some(sub) = sub {
            if let Some(tier) = self.subcommands.get(&(program.clone(), sub)) {
                return *tier;
            }
        }
        self.programs.get(&program).copied().unwrap_or(RiskTier::Admin)
    }
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self::from_config(&PolicySection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(args: &[&str]) -> ActionSuggestion {
        ActionSuggestion::RunTerminalCommand {
            argv: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_file_tools() {
        let policy = ActionPolicy::default();
        let create = ActionSuggestion::CreateFile {
            path: "out.txt".into(),
            content: "hello".into(),
        };
        assert_eq!(policy.classify(&create), RiskTier::AutoAllowed);
        let edit = ActionSuggestion::EditFile {
            path: "src/main.rs".into(),
            content: String::new(),
        };
        assert_eq!(policy.classify(&edit), RiskTier::Restricted);
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let policy = ActionPolicy::default();
        assert_eq!(policy.classify(&cmd(&["cargo", "test"])), RiskTier::AutoAllowed);
        assert_eq!(policy.classify(&cmd(&["cargo", "--quiet", "test"])), RiskTier::AutoAllowed);
        assert_eq!(policy.classify(&cmd(&["cargo", "add", "serde"])), RiskTier::Restricted);
        assert_eq!(policy.classify(&cmd(&["git", "status"])), RiskTier::AutoAllowed);
        assert_eq!(policy.classify(&cmd(&["git", "push"])), RiskTier::Restricted);
        assert_eq!(policy.classify(&cmd(&["rm", "-rf", "build/"])), RiskTier::Restricted);
        assert_eq!(policy.classify(&cmd(&["sudo", "ls"])), RiskTier::Admin);
    }

    #[test]
    fn test_unknown_program_is_most_restrictive() {
        let policy = ActionPolicy::default();
        assert_eq!(policy.classify(&cmd(&["curl", "x"])), RiskTier::Admin);
        assert_eq!(policy.classify(&cmd(&[])), RiskTier::Admin);
        assert!(!policy.allowed_programs().contains("curl"));
        assert!(policy.allowed_programs().contains("pytest"));
    }

    #[test]
    fn test_interpreters_need_confirmation() {
        let policy = ActionPolicy::default();
        assert_eq!(policy.classify(&cmd(&["python3", "app.py"])), RiskTier::Restricted);
        assert_eq!(policy.classify(&cmd(&["python", "-c", "print(1)"])), RiskTier::Restricted);
        assert_eq!(policy.classify(&cmd(&["node", "index.js"])), RiskTier::Restricted);
        assert_eq!(policy.classify(&cmd(&["pytest", "-q"])), RiskTier::AutoAllowed);
    }
}
