//! 输入校验：与风险等级无关，先于确认执行
//!
//! - 文件路径必须落在沙箱根内；
//! - 命令程序名必须在白名单中，且不能带路径；
//! - 参数不得包含用于串联命令的 shell 元字符；
//! - 形似路径的参数同样不得越出根目录；
//! - 写入内容不得超过文件大小上限。

use std::collections::HashSet;

use crate::core::ActionSuggestion;
use crate::gateway::fs::SafeFs;

/// 被视为命令注入的片段
const INJECTION_TOKENS: &[&str] = &[";", "&&", "||", "|", "`", "$(", "${", ">", "<", "\n", "\r"];

/// 动作校验器
#[derive(Debug, Clone)]
pub struct Validator {
    fs: SafeFs,
    allowed_programs: HashSet<String>,
}

impl Validator {
    pub fn new(fs: SafeFs, allowed_programs: HashSet<String>) -> Self {
        let allowed_programs = allowed_programs
            .into_iter()
            .map(|p| p.to_lowercase())
            .collect();
        Self {
            fs,
            allowed_programs,
        }
    }

    /// 校验通过返回 Ok，否则返回拒绝原因
    pub fn validate(&self, action: &ActionSuggestion) -> Result<(), String> {
        match action {
            ActionSuggestion::CreateFile { path, content }
            | ActionSuggestion::EditFile { path, content } => {
                self.check_path(path)?;
                let limit = self.fs.max_file_bytes();
                if content.len() as u64 > limit {
                    return Err(format!(
                        "Content for {} is {} bytes, exceeds limit {}",
                        path,
                        content.len(),
                        limit
                    ));
                }
                Ok(())
            }
            ActionSuggestion::ReadFile { path } => self.check_path(path),
            ActionSuggestion::ListDir { path } => {
                if path.trim().is_empty() || path.trim() == "." {
                    Ok(())
                } else {
                    self.check_path(path)
                }
            }
            ActionSuggestion::RunTerminalCommand { argv } => self.check_command(argv),
        }
    }

    fn check_path(&self, path: &str) -> Result<(), String> {
        self.fs.resolve(path).map(|_| ()).map_err(|e| e.to_string())
    }

    fn check_command(&self, argv: &[String]) -> Result<(), String> {
        let program = argv
            .first()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "Empty command".to_string())?;
        if program.contains('/') || program.contains('\\') {
            return Err(format!("Program must be a bare command name: {}", program));
        }
        if !self.allowed_programs.contains(&program.to_lowercase()) {
            return Err(format!("Command '{}' not in allowlist", program));
        }
        for arg in argv {
            if let Some(token) = INJECTION_TOKENS.iter().find(|t| arg.contains(*t)) {
                return Err(format!("Forbidden token {:?} in argument {:?}", token, arg));
            }
        }
        for arg in argv.iter().skip(1) {
            let value = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with('-') => value,
                _ if arg.starts_with('-') => continue,
                _ => arg.as_str(),
            };
            if looks_like_path(value) {
                self.check_path(value)
                    .map_err(|e| format!("Argument {:?} rejected: {}", arg, e))?;
            }
        }
        Ok(())
    }
}

fn looks_like_path(arg: &str) -> bool {
    if arg.contains("://") {
        return false;
    }
    arg.starts_with('/') || arg.starts_with('~') || arg.starts_with('.') || arg.contains('/')
}
