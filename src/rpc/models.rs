//! Records returned by the daemon's management methods.
//!
//! Fields the daemon does not always send decode with defaults, so records
//! from older or newer daemons still parse.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An entry of `list-fs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSystemItem {
    pub id: Uuid,
    pub name: String,
    /// Provider the filesystem was created from.
    pub kind_id: Uuid,
    pub is_running: bool,
    /// Whether the filesystem is visible to every session.
    #[serde(default)]
    pub is_global: bool,
}

/// An entry of `list-fsp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSystemProviderItem {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Configuration skeleton for new filesystems of this kind.
    #[serde(default)]
    pub template_config: Value,
}

/// An entry of `list-fsrv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FServerItem {
    pub id: Uuid,
    pub name: String,
    pub kind_id: Uuid,
    /// Filesystem this server exposes.
    pub in_fs_id: Uuid,
    pub is_running: bool,
}

/// An entry of `list-fsrvp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FServerProviderItem {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub template_config: Value,
    #[serde(default)]
    pub is_hidden: bool,
}

/// Result of `get-fs-info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSystemInfo {
    pub name: String,
    pub kind_id: Uuid,
    pub is_running: bool,
    #[serde(default)]
    pub config: Value,
}

/// Result of `get-fsrv-info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FServerInfo {
    pub name: String,
    pub kind_id: Uuid,
    pub in_fs_id: Uuid,
    pub is_running: bool,
    #[serde(default)]
    pub config: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_item_without_optional_fields() {
        let id = Uuid::new_v4();
        let kind = Uuid::new_v4();
        let item: FileSystemItem = serde_json::from_value(json!({
            "id": id,
            "name": "photos",
            "kind_id": kind,
            "is_running": true,
        }))
        .unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.kind_id, kind);
        assert!(item.is_running);
        assert!(!item.is_global);
    }

    #[test]
    fn provider_item_keeps_template() {
        let item: FServerProviderItem = serde_json::from_value(json!({
            "id": Uuid::nil(),
            "name": "dokan",
            "version": "1.0.0",
            "template_config": {"mount_point": "X:"},
            "is_hidden": true,
        }))
        .unwrap();
        assert_eq!(item.version.as_deref(), Some("1.0.0"));
        assert_eq!(item.template_config["mount_point"], "X:");
        assert!(item.is_hidden);
    }

    #[test]
    fn server_info_requires_input_filesystem() {
        let missing = serde_json::from_value::<FServerInfo>(json!({
            "name": "share",
            "kind_id": Uuid::nil(),
            "is_running": false,
        }));
        assert!(missing.is_err());
    }
}
