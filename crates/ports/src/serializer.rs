//! 序列化器 trait 定义

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tiercache_errors::{AppError, AppResult};

/// 序列化器：值 <-> 字节
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> AppResult<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> AppResult<T>;
}

/// JSON 序列化器
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Serializer<T> for JsonSerializer<T> {
    fn serialize(&self, value: &T) -> AppResult<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| AppError::serialization(format!("Failed to encode value: {}", e)))
    }

    fn deserialize(&self, bytes: &[u8]) -> AppResult<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| AppError::serialization(format!("Failed to decode value: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_serializer_rejects_garbage() {
        let serializer = JsonSerializer::<Vec<u32>>::new();
        let err = serializer.deserialize(b"\x00\x01not-json").unwrap_err();
        assert!(matches!(err, AppError::Serialization(_)));
    }

    #[test]
    fn test_json_serializer_bytes() {
        let serializer = JsonSerializer::<String>::new();
        assert_eq!(serializer.serialize(&"A".to_string()).unwrap(), b"\"A\"".to_vec());
        assert_eq!(serializer.deserialize(b"\"A\"").unwrap(), "A");
    }
}
