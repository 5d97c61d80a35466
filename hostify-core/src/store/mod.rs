//! 持久化配置存储：路径 + 键的字符串寻址，值为若干固定形态。
//!
//! 生产环境由注册表实现（见 `RegistryStore`），测试与嵌入场景使用 [`MemoryStore`]。

use crate::error::{Result, ServiceError};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub mod keys;
#[cfg(windows)]
mod registry;

#[cfg(windows)]
pub use registry::RegistryStore;

/// 存储值的几种形态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreValue {
    String(String),
    MultiString(Vec<String>),
    Binary(Vec<u8>),
    U32(u32),
    U64(u64),
}

impl StoreValue {
    pub fn into_string(self) -> Option<String> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// 外部同步的键值存储；多键之间不提供事务保证。
pub trait ConfigStore: Send + Sync {
    fn get(&self, path: &str, key: &str) -> Result<StoreValue>;
    fn set(&self, path: &str, key: &str, value: StoreValue) -> Result<()>;
    /// `key` 为 None 时删除整个路径（含子路径）。
    fn delete(&self, path: &str, key: Option<&str>) -> Result<()>;

    /// 读取字符串值，类型不符视为配置错误。
    fn get_string(&self, path: &str, key: &str) -> Result<String> {
        self.get(path, key)?.into_string().ok_or_else(|| {
            ServiceError::invalid_config(format!("{path} [{key}] is not a string value"))
        })
    }
}

impl<T: ConfigStore + ?Sized> ConfigStore for &T {
    fn get(&self, path: &str, key: &str) -> Result<StoreValue> {
        (**self).get(path, key)
    }

    fn set(&self, path: &str, key: &str, value: StoreValue) -> Result<()> {
        (**self).set(path, key, value)
    }

    fn delete(&self, path: &str, key: Option<&str>) -> Result<()> {
        (**self).delete(path, key)
    }
}

/// 进程内存储；路径大小写不敏感，与注册表一致。
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, BTreeMap<String, StoreValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某路径是否存在（测试辅助）。
    pub fn contains_path(&self, path: &str) -> bool {
        self.lock()
            .map(|entries| entries.contains_key(&normalize(path)))
            .unwrap_or(false)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, StoreValue>>>> {
        self.entries
            .lock()
            .map_err(|_| ServiceError::Other("memory store poisoned".into()))
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, path: &str, key: &str) -> Result<StoreValue> {
        let entries = self.lock()?;
        entries
            .get(&normalize(path))
            .and_then(|values| values.get(&key.to_ascii_lowercase()))
            .cloned()
            .ok_or_else(|| not_found(path, key))
    }

    fn set(&self, path: &str, key: &str, value: StoreValue) -> Result<()> {
        let mut entries = self.lock()?;
        entries
            .entry(normalize(path))
            .or_default()
            .insert(key.to_ascii_lowercase(), value);
        Ok(())
    }

    fn delete(&self, path: &str, key: Option<&str>) -> Result<()> {
        let mut entries = self.lock()?;
        let path_key = normalize(path);
        match key {
            Some(key) => entries
                .get_mut(&path_key)
                .and_then(|values| values.remove(&key.to_ascii_lowercase()))
                .map(|_| ())
                .ok_or_else(|| not_found(path, key)),
            None => {
                let prefix = format!("{path_key}\\");
                let before = entries.len();
                entries.retain(|k, _| *k != path_key && !k.starts_with(&prefix));
                if entries.len() == before {
                    Err(not_found(path, ""))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// 统一分隔符、去掉尾部分隔符并转小写。
fn normalize(path: &str) -> String {
    path.replace('/', "\\")
        .trim_matches('\\')
        .to_ascii_lowercase()
}

fn not_found(path: &str, key: &str) -> ServiceError {
    ServiceError::StoreNotFound {
        path: path.to_string(),
        key: key.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "entry does not exist"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete_value() {
        let store = MemoryStore::new();
        store
            .set(r"HKLM\Software\Demo", "Value", StoreValue::U32(1))
            .unwrap();
        assert_eq!(
            store.get("hklm/software/demo/", "value").unwrap(),
            StoreValue::U32(1)
        );
        store.delete(r"HKLM\Software\Demo", Some("Value")).unwrap();
        let err = store.get(r"HKLM\Software\Demo", "Value").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_path_removes_children() {
        let store = MemoryStore::new();
        store
            .set(r"HKLM\A", "x", StoreValue::String("1".into()))
            .unwrap();
        store
            .set(r"HKLM\A\B", "y", StoreValue::String("2".into()))
            .unwrap();
        store
            .set(r"HKLM\AB", "z", StoreValue::String("3".into()))
            .unwrap();

        store.delete(r"HKLM\A", None).unwrap();
        assert!(!store.contains_path(r"HKLM\A"));
        assert!(!store.contains_path(r"HKLM\A\B"));
        assert!(store.contains_path(r"HKLM\AB"));
    }

    #[test]
    fn deleting_missing_entries_reports_not_found() {
        let store = MemoryStore::new();
        assert!(store.delete(r"HKLM\Nope", None).unwrap_err().is_not_found());
        assert!(store
            .delete(r"HKLM\Nope", Some("v"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn get_string_rejects_other_shapes() {
        let store = MemoryStore::new();
        store.set(r"HKLM\A", "n", StoreValue::U64(7)).unwrap();
        assert!(matches!(
            store.get_string(r"HKLM\A", "n"),
            Err(ServiceError::InvalidConfig(_))
        ));
    }
}
