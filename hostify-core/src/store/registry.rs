//! 注册表实现：`HKLM\...` 形式的路径拆分为预定义根键 + 子键。

use super::{ConfigStore, StoreValue};
use crate::error::{Result, ServiceError};
use std::ffi::{c_void, OsStr};
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use windows_sys::Win32::Foundation::{ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_SUCCESS};
use windows_sys::Win32::System::Registry::{
    RegDeleteKeyValueW, RegDeleteTreeW, RegGetValueW, RegSetKeyValueW, HKEY, HKEY_CLASSES_ROOT,
    HKEY_CURRENT_CONFIG, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, HKEY_USERS, REG_BINARY, REG_DWORD,
    REG_MULTI_SZ, REG_QWORD, REG_SZ, RRF_RT_ANY,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryStore;

impl RegistryStore {
    pub fn new() -> Self {
        Self
    }
}

const PREDEFINED_KEYS: [(&str, HKEY); 10] = [
    ("HKEY_CLASSES_ROOT", HKEY_CLASSES_ROOT),
    ("HKEY_CURRENT_CONFIG", HKEY_CURRENT_CONFIG),
    ("HKEY_CURRENT_USER", HKEY_CURRENT_USER),
    ("HKEY_LOCAL_MACHINE", HKEY_LOCAL_MACHINE),
    ("HKEY_USERS", HKEY_USERS),
    ("HKCR", HKEY_CLASSES_ROOT),
    ("HKCC", HKEY_CURRENT_CONFIG),
    ("HKCU", HKEY_CURRENT_USER),
    ("HKLM", HKEY_LOCAL_MACHINE),
    ("HKU", HKEY_USERS),
];

/// 拆分出根键与子键；根键之后必须还有子键。
fn decompose(path: &str) -> Result<(HKEY, Vec<u16>)> {
    let normalized = path.replace('/', "\\");
    let trimmed = normalized.trim_matches('\\');
    if let Some((root, sub_key)) = trimmed.split_once('\\') {
        let sub_key = sub_key.trim_matches('\\');
        if let Some((_, hkey)) = PREDEFINED_KEYS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(root))
        {
            if !sub_key.is_empty() {
                return Ok((*hkey, wide(sub_key)));
            }
        }
    }
    Err(ServiceError::invalid_config(format!(
        "illegal registry key: {path}"
    )))
}

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

fn check(code: u32, path: &str, key: &str) -> Result<()> {
    let source = std::io::Error::from_raw_os_error(code as i32);
    let (path, key) = (path.to_string(), key.to_string());
    match code {
        ERROR_SUCCESS => Ok(()),
        ERROR_FILE_NOT_FOUND => Err(ServiceError::StoreNotFound { path, key, source }),
        ERROR_ACCESS_DENIED => Err(ServiceError::StoreAccessDenied { path, key, source }),
        _ => Err(ServiceError::Store { path, key, source }),
    }
}

fn encode(value: &StoreValue) -> (u32, Vec<u8>) {
    fn utf16_bytes(units: impl Iterator<Item = u16>) -> Vec<u8> {
        units.flat_map(u16::to_le_bytes).collect()
    }

    match value {
        StoreValue::String(s) => (REG_SZ, utf16_bytes(wide(s).into_iter())),
        StoreValue::MultiString(items) => {
            let units = items
                .iter()
                .flat_map(|s| wide(s))
                .chain(Some(0))
                .collect::<Vec<_>>();
            (REG_MULTI_SZ, utf16_bytes(units.into_iter()))
        }
        StoreValue::Binary(data) => (REG_BINARY, data.clone()),
        StoreValue::U32(v) => (REG_DWORD, v.to_le_bytes().to_vec()),
        StoreValue::U64(v) => (REG_QWORD, v.to_le_bytes().to_vec()),
    }
}

fn decode(kind: u32, data: &[u8]) -> Result<StoreValue> {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let value = match kind {
        REG_SZ => {
            let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
            StoreValue::String(String::from_utf16_lossy(&units[..end]))
        }
        REG_MULTI_SZ => StoreValue::MultiString(
            units
                .split(|&u| u == 0)
                .filter(|s| !s.is_empty())
                .map(String::from_utf16_lossy)
                .collect(),
        ),
        REG_DWORD if data.len() >= 4 => {
            StoreValue::U32(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
        }
        REG_QWORD if data.len() >= 8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[..8]);
            StoreValue::U64(u64::from_le_bytes(bytes))
        }
        _ => StoreValue::Binary(data.to_vec()),
    };
    Ok(value)
}

impl ConfigStore for RegistryStore {
    fn get(&self, path: &str, key: &str) -> Result<StoreValue> {
        let (hkey, sub_key) = decompose(path)?;
        let name = wide(key);
        let mut kind = 0u32;
        let mut size = 0u32;

        // 先取长度再取数据
        // SAFETY: 宽字符串均以 NUL 结尾，且在调用期间存活
        let code = unsafe {
            RegGetValueW(
                hkey,
                sub_key.as_ptr(),
                name.as_ptr(),
                RRF_RT_ANY,
                &mut kind,
                ptr::null_mut(),
                &mut size,
            )
        };
        check(code, path, key)?;

        let mut data = vec![0u8; size as usize];
        let code = unsafe {
            RegGetValueW(
                hkey,
                sub_key.as_ptr(),
                name.as_ptr(),
                RRF_RT_ANY,
                &mut kind,
                data.as_mut_ptr() as *mut c_void,
                &mut size,
            )
        };
        check(code, path, key)?;
        data.truncate(size as usize);
        decode(kind, &data)
    }

    fn set(&self, path: &str, key: &str, value: StoreValue) -> Result<()> {
        let (hkey, sub_key) = decompose(path)?;
        let name = wide(key);
        let (kind, data) = encode(&value);
        let code = unsafe {
            RegSetKeyValueW(
                hkey,
                sub_key.as_ptr(),
                name.as_ptr(),
                kind,
                data.as_ptr() as *const c_void,
                data.len() as u32,
            )
        };
        check(code, path, key)
    }

    fn delete(&self, path: &str, key: Option<&str>) -> Result<()> {
        let (hkey, sub_key) = decompose(path)?;
        let code = match key {
            Some(key) => {
                let name = wide(key);
                unsafe { RegDeleteKeyValueW(hkey, sub_key.as_ptr(), name.as_ptr()) }
            }
            None => unsafe { RegDeleteTreeW(hkey, sub_key.as_ptr()) },
        };
        check(code, path, key.unwrap_or_default())
    }
}
