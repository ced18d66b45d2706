//! 参数纠正（retry-with-correction 策略使用）
//!
//! 启发式：工具报告某个选项非法时去掉该选项；程序不存在时换成配置的别名（如 python → python3）。

use std::collections::HashMap;

use crate::recovery::diagnosis::Diagnosis;

#[derive(Debug, Clone, Default)]
pub struct ArgumentCorrector {
    aliases: HashMap<String, String>,
}

impl ArgumentCorrector {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        Self { aliases }
    }

    /// 返回修正后的参数；无法修正时返回 None
    pub fn correct(&self, argv: &[String], diagnosis: &Diagnosis, message: &str) -> Option<Vec<String>> {
        let (program, args) = argv.split_first()?;

        if let Some(flag) = diagnosis.detail.as_deref().filter(|d| d.starts_with('-')) {
            let prefix = format!("{}=", flag);
            let kept: Vec<String> = args
                .iter()
                .filter(|a| a.as_str() != flag && !a.starts_with(&prefix))
                .cloned()
                .collect();
            if kept.len() != args.len() {
                return Some(std::iter::once(program.clone()).chain(kept).collect());
            }
        }

        let lower = message.to_lowercase();
        let program_missing = lower.contains("command not found")
            || (lower.contains("no such file or directory") && lower.contains(&program.to_lowercase()));
        if program_missing {
            if let Some(alias) = self.aliases.get(program) {
                return Some(std::iter::once(alias.clone()).chain(args.iter().cloned()).collect());
            }
        }
        None
    }
}
