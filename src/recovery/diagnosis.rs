//! 错误诊断：先做正则匹配（廉价、确定），都不命中时才调用外部分类器

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{ErrorKind, TaskError};
use crate::intent::Classifier;

/// 诊断来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisSource {
    /// 由错误类别直接推出（如超时）
    Kind,
    Pattern,
    Classifier,
    Default,
}

/// 诊断结果；detail 为模式中捕获的关键片段（缺失的包名、非法选项等）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub kind: ErrorKind,
    pub detail: Option<String>,
    pub source: DiagnosisSource,
}

impl Diagnosis {
    fn new(kind: ErrorKind, detail: Option<String>, source: DiagnosisSource) -> Self {
        Self {
            kind,
            detail,
            source,
        }
    }
}

/// 按顺序匹配；缺失依赖排在代码缺陷之前（Traceback 中常同时出现 ModuleNotFoundError）
const PATTERNS: &[(ErrorKind, &str)] = &[
    (ErrorKind::MissingDependency, r"No module named '?([\w\.\-]+)'?"),
    (ErrorKind::MissingDependency, r"Cannot find module '([^']+)'"),
    (ErrorKind::MissingDependency, r"can't find crate for `(\w+)`"),
    (ErrorKind::MissingDependency, r"No matching distribution found for ([\w\.\-]+)"),
    (ErrorKind::MissingDependency, r#"(?i)package ['"]?([\w\.\-@/]+)['"]? (?:was )?not found"#),
    (ErrorKind::SyntaxOrArgument, r"(?i)unrecognized (?:option|arguments?):? '?(-[\w\-]+)"),
    (ErrorKind::SyntaxOrArgument, r"(?i)(?:invalid|unknown) option:? '?(-[\w\-]+)"),
    (ErrorKind::SyntaxOrArgument, r"(?i)unexpected argument '(-[\w\-]+)"),
    (ErrorKind::SyntaxOrArgument, r"(?i)([\w\.\-]+): command not found"),
    (ErrorKind::SyntaxOrArgument, r"(?i)no such file or directory"),
    (ErrorKind::SyntaxOrArgument, r"(?im)^usage:"),
    (ErrorKind::CodeDefect, r"Traceback \(most recent call last\)"),
    (ErrorKind::CodeDefect, r"\b(SyntaxError|TypeError|NameError|AttributeError|IndexError|KeyError|AssertionError)\b"),
    (ErrorKind::CodeDefect, r"error\[(E\d{4})\]"),
    (ErrorKind::SystemOrPermission, r"(?i)permission denied"),
    (ErrorKind::SystemOrPermission, r"(?i)connection refused"),
    (ErrorKind::SystemOrPermission, r"(?i)address already in use"),
    (ErrorKind::SystemOrPermission, r"(?i)no space left on device"),
    (ErrorKind::SystemOrPermission, r"(?i)could not resolve host"),
    (ErrorKind::SystemOrPermission, r"(?i)timed out"),
];

fn compiled() -> &'static [(ErrorKind, Regex)] {
    static COMPILED: OnceLock<Vec<(ErrorKind, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PATTERNS
            .iter()
            .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (*kind, re)))
            .collect()
    })
}

/// 仅做模式匹配
pub fn match_patterns(text: &str) -> Option<Diagnosis> {
    compiled().iter().find_map(|(kind, re)| {
        re.captures(text).map(|caps| {
            let detail = caps.get(1).map(|m| m.as_str().to_string());
            Diagnosis::new(*kind, detail, DiagnosisSource::Pattern)
        })
    })
}

/// 错误诊断器
#[derive(Default, Clone)]
pub struct ErrorDiagnoser {
    classifier: Option<Arc<dyn Classifier>>,
    min_confidence: f32,
}

impl ErrorDiagnoser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模式都不命中时的兜底分类器，置信度低于阈值视为 Unclassified
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>, min_confidence: f32) -> Self {
        self.classifier = Some(classifier);
        self.min_confidence = min_confidence;
        self
    }

    pub async fn diagnose(&self, error: &TaskError) -> Diagnosis {
        match error.kind {
            ErrorKind::ExecutionTimeout | ErrorKind::ResourceLimit => {
                return Diagnosis::new(
                    ErrorKind::SystemOrPermission,
                    None,
                    DiagnosisSource::Kind,
                );
            }
            kind if kind.is_diagnosis() && kind != ErrorKind::Unclassified => {
                return Diagnosis::new(kind, None, DiagnosisSource::Kind);
            }
            _ => {}
        }

        if let Some(diagnosis) = match_patterns(&error.message) {
            return diagnosis;
        }

        if let Some(classifier) = &self.classifier {
            match classifier.classify(&error.message).await {
                Ok(c) if c.confidence >= self.min_confidence => {
                    if let Some(kind) = ErrorKind::from_label(&c.label) {
                        return Diagnosis::new(kind, None, DiagnosisSource::Classifier);
                    }
                }
                Ok(c) => {
                    tracing::debug!(label = %c.label, confidence = c.confidence, "error classifier below threshold");
                }
                Err(e) => tracing::warn!(error = %e, "error classifier failed"),
            }
        }
        Diagnosis::new(ErrorKind::Unclassified, None, DiagnosisSource::Default)
    }
}
