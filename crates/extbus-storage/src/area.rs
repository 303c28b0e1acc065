//! Storage areas exposed to extensions

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    Local,
    Sync,
    Session,
    Managed,
}

impl StorageArea {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageArea::Local => "local",
            StorageArea::Sync => "sync",
            StorageArea::Session => "session",
            StorageArea::Managed => "managed",
        }
    }
}

impl std::fmt::Display for StorageArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StorageArea {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(StorageArea::Local),
            "sync" => Ok(StorageArea::Sync),
            "session" => Ok(StorageArea::Session),
            "managed" => Ok(StorageArea::Managed),
            _ => Err(StorageError::InvalidArea(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_area() {
        assert_eq!("local".parse::<StorageArea>().unwrap(), StorageArea::Local);
        assert_eq!("SYNC".parse::<StorageArea>().unwrap(), StorageArea::Sync);
        assert!("cloud".parse::<StorageArea>().is_err());
    }
}
