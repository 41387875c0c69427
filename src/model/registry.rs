use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::model::definition::WorkflowDefinition;

/// 语义化版本键
/// 按数字段比较 ("10.0.0" > "9.0.0")；无法解析为数字的段退回字符串比较。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    raw: String,
    numeric: Vec<Option<u64>>,
}

impl Version {
    pub fn parse(raw: &str) -> Self {
        let numeric = raw
            .split('.')
            .map(|segment| segment.parse::<u64>().ok())
            .collect();
        Self {
            raw: raw.to_string(),
            numeric,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.numeric.len().max(other.numeric.len());
        for i in 0..len {
            let a = self.numeric.get(i).cloned().flatten();
            let b = other.numeric.get(i).cloned().flatten();
            let ord = match (a, b) {
                (Some(a), Some(b)) => a.cmp(&b),
                // Numeric segments sort above non-numeric ones.
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => {
                    let a = self.raw.split('.').nth(i).unwrap_or("");
                    let b = other.raw.split('.').nth(i).unwrap_or("");
                    a.cmp(b)
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.raw.cmp(&other.raw)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 工作流注册表：name → version → Definition
/// 同名同版本重复注册只保留一份 (覆盖，不产生重复条目)。
#[derive(Default)]
pub struct Registry {
    entries: DashMap<String, BTreeMap<Version, Arc<WorkflowDefinition>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn register(&self, definition: WorkflowDefinition) {
        let name = definition.name.clone();
        let version = Version::parse(&definition.version);
        debug!(workflow = %name, version = %definition.version, "registering definition");
        self.entries
            .entry(name)
            .or_default()
            .insert(version, Arc::new(definition));
    }

    /// 取指定版本；version 为 None 时按语义版本取最新。
    pub fn get(&self, name: &str, version: Option<&str>) -> EngineResult<Arc<WorkflowDefinition>> {
        let not_found = || EngineError::WorkflowNotFound {
            name: name.to_string(),
            version: version.map(|v| v.to_string()),
        };
        let versions = self.entries.get(name).ok_or_else(not_found)?;
        match version {
            Some(v) => versions.get(&Version::parse(v)).cloned().ok_or_else(not_found),
            // BTreeMap keeps versions ordered, the last entry is the latest.
            None => versions
                .last_key_value()
                .map(|(_, def)| def.clone())
                .ok_or_else(not_found),
        }
    }

    /// 注销一个版本；version 为 None 或最后一个版本被移除时删除整个条目。
    pub fn unregister(&self, name: &str, version: Option<&str>) -> EngineResult<()> {
        let mut remove_entry = false;
        {
            let mut versions = self
                .entries
                .get_mut(name)
                .ok_or_else(|| EngineError::WorkflowNotFound {
                    name: name.to_string(),
                    version: version.map(|v| v.to_string()),
                })?;
            match version {
                Some(v) => {
                    if versions.remove(&Version::parse(v)).is_none() {
                        return Err(EngineError::WorkflowNotFound {
                            name: name.to_string(),
                            version: Some(v.to_string()),
                        });
                    }
                    remove_entry = versions.is_empty();
                }
                None => remove_entry = true,
            }
        }
        if remove_entry {
            self.entries.remove(name);
        }
        Ok(())
    }

    pub fn versions(&self, name: &str) -> Vec<String> {
        self.entries
            .get(name)
            .map(|versions| versions.keys().map(|v| v.as_str().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}
