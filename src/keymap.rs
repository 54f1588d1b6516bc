//! Keysym-to-keycode mapping for input injection.
//!
//! The RFB KeyEvent carries X keysyms; the display adapter wants platform
//! keycodes. An optional JSON keymap file (`{"0xff0d": 36, ...}`, values
//! either one keycode or an array pressed in order) overrides the
//! identity mapping for exotic layouts.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{LtsmError, Result};

/// Injectable keysym translation table.
#[derive(Debug, Default)]
pub struct Keymap {
    map: HashMap<u32, Vec<u32>>,
}

impl Keymap {
    /// Loads a JSON keymap file. Keys are keysyms in decimal or `0x` hex
    /// strings; values are a keycode or an array of keycodes.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)
            .map_err(|e| LtsmError::Protocol(format!("keymap {}: {e}", path.display())))?;

        let mut map = HashMap::with_capacity(object.len());
        for (key, value) in object {
            let keysym = parse_keysym(&key)
                .ok_or_else(|| LtsmError::Protocol(format!("keymap: bad keysym `{key}'")))?;
            let codes = match value {
                serde_json::Value::Number(n) => {
                    vec![n.as_u64().unwrap_or(0) as u32]
                }
                serde_json::Value::Array(items) => items
                    .iter()
                    .filter_map(|item| item.as_u64())
                    .map(|code| code as u32)
                    .collect(),
                _ => {
                    return Err(LtsmError::Protocol(format!(
                        "keymap: bad value for `{key}'"
                    )))
                }
            };
            map.insert(keysym, codes);
        }
        log::info!("keymap loaded: {}, items: {}", path.display(), map.len());
        Ok(Self { map })
    }

    /// Keycodes to inject for a keysym. Without an override the keysym
    /// passes through unchanged, which suits displays that accept
    /// keysyms directly.
    pub fn translate(&self, keysym: u32) -> Vec<u32> {
        match self.map.get(&keysym) {
            Some(codes) => codes.clone(),
            None => vec![keysym],
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn parse_keysym(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_without_overrides() {
        let keymap = Keymap::default();
        assert_eq!(keymap.translate(0xFF0D), vec![0xFF0D]);
    }

    #[test]
    fn loads_hex_keys_and_arrays() {
        let dir = std::env::temp_dir().join("ltsm-keymap-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("map.json");
        std::fs::write(&path, r#"{"0xff0d": 36, "65": [50, 38]}"#).unwrap();

        let keymap = Keymap::load(&path).unwrap();
        assert_eq!(keymap.translate(0xFF0D), vec![36]);
        assert_eq!(keymap.translate(65), vec![50, 38]);
        assert_eq!(keymap.translate(66), vec![66]);
        std::fs::remove_file(&path).unwrap();
    }
}
