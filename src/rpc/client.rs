//! Typed client for the daemon's management methods.
//!
//! Every method sends one request and waits for its response. Nothing is
//! retried; failures reach the caller as they are.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use super::connection::Connection;
use super::models::{
    FServerInfo, FServerItem, FServerProviderItem, FileSystemInfo, FileSystemItem,
    FileSystemProviderItem,
};
use super::protocol::method;
use crate::error::{Error, Result};
use crate::transport::{Connector, WebSocketConnector};

/// Client for a WinMount daemon.
///
/// Cheap to clone; clones share one connection, which is closed when the last
/// clone is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    conn: Arc<Connection>,
}

#[derive(Serialize)]
struct IdParams {
    id: Uuid,
}

#[derive(Serialize)]
struct CreateParams<'a> {
    name: &'a str,
    kind_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_fs_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<Value>,
}

#[derive(Serialize)]
struct UpdateParams<'a> {
    id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<Value>,
}

impl<'a> UpdateParams<'a> {
    fn new(id: Uuid, name: Option<&'a str>, config: Option<Value>) -> Self {
        Self {
            id,
            name: name.filter(|name| !name.is_empty()),
            config,
        }
    }
}

mod data {
    use serde::Deserialize;
    use uuid::Uuid;

    use super::{FServerItem, FServerProviderItem, FileSystemItem, FileSystemProviderItem};

    #[derive(Deserialize)]
    pub struct FsId {
        pub fs_id: Uuid,
    }

    #[derive(Deserialize)]
    pub struct FsrvId {
        pub fsrv_id: Uuid,
    }

    #[derive(Deserialize)]
    pub struct Started {
        pub new_started: bool,
    }

    #[derive(Deserialize)]
    pub struct Stopped {
        pub new_stopped: bool,
    }

    #[derive(Deserialize)]
    pub struct FsList {
        pub fs_list: Vec<FileSystemItem>,
    }

    #[derive(Deserialize)]
    pub struct FspList {
        pub fsp_list: Vec<FileSystemProviderItem>,
    }

    #[derive(Deserialize)]
    pub struct FsrvList {
        pub fsrv_list: Vec<FServerItem>,
    }

    #[derive(Deserialize)]
    pub struct FsrvpList {
        pub fsrvp_list: Vec<FServerProviderItem>,
    }
}

fn to_params(params: impl Serialize) -> Result<Option<Value>> {
    serde_json::to_value(params).map(Some).map_err(Error::Encode)
}

impl Client {
    /// Connects to a daemon over WebSocket, e.g. `ws://127.0.0.1:19423/ws`.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(&WebSocketConnector, url).await
    }

    /// Connects through the given transport.
    pub async fn connect_with(connector: &dyn Connector, url: &str) -> Result<Self> {
        let conn = Connection::connect(connector, url).await?;
        Ok(Self {
            conn: Arc::new(conn),
        })
    }

    pub fn daemon_version(&self) -> &str {
        self.conn.daemon_version()
    }

    /// The underlying connection, for raw requests.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Closes the connection for every clone of this client.
    pub fn close(&self) {
        self.conn.close();
    }

    /// Asks the daemon to end this session, then closes locally.
    pub async fn close_session(&self) -> Result<()> {
        let outcome = self.call::<Value>(method::CLOSE_CURRENT_SESSION, None).await;
        self.conn.close();
        match outcome {
            Ok(_) | Err(Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T> {
        let data = self.conn.do_request(method, params).await?.into_result()?;
        serde_json::from_value(data).map_err(Error::Decode)
    }

    /// Creates a filesystem from provider `kind_id` and returns its id.
    pub async fn create_fs(&self, name: &str, kind_id: Uuid, config: Option<Value>) -> Result<Uuid> {
        let params = to_params(CreateParams {
            name,
            kind_id,
            in_fs_id: None,
            config,
        })?;
        let data: data::FsId = self.call(method::CREATE_FS, params).await?;
        Ok(data.fs_id)
    }

    pub async fn remove_fs(&self, id: Uuid) -> Result<()> {
        self.call::<Value>(method::REMOVE_FS, to_params(IdParams { id })?)
            .await
            .map(drop)
    }

    /// Returns false if the filesystem was already running.
    pub async fn start_fs(&self, id: Uuid) -> Result<bool> {
        let data: data::Started = self.call(method::START_FS, to_params(IdParams { id })?).await?;
        Ok(data.new_started)
    }

    /// Returns false if the filesystem was already stopped.
    pub async fn stop_fs(&self, id: Uuid) -> Result<bool> {
        let data: data::Stopped = self.call(method::STOP_FS, to_params(IdParams { id })?).await?;
        Ok(data.new_stopped)
    }

    /// Creates a filesystem server exposing `in_fs_id` and returns its id.
    pub async fn create_fsrv(
        &self,
        name: &str,
        kind_id: Uuid,
        in_fs_id: Uuid,
        config: Option<Value>,
    ) -> Result<Uuid> {
        let params = to_params(CreateParams {
            name,
            kind_id,
            in_fs_id: Some(in_fs_id),
            config,
        })?;
        let data: data::FsrvId = self.call(method::CREATE_FSRV, params).await?;
        Ok(data.fsrv_id)
    }

    pub async fn remove_fsrv(&self, id: Uuid) -> Result<()> {
        self.call::<Value>(method::REMOVE_FSRV, to_params(IdParams { id })?)
            .await
            .map(drop)
    }

    pub async fn start_fsrv(&self, id: Uuid) -> Result<bool> {
        let data: data::Started = self
            .call(method::START_FSRV, to_params(IdParams { id })?)
            .await?;
        Ok(data.new_started)
    }

    pub async fn stop_fsrv(&self, id: Uuid) -> Result<bool> {
        let data: data::Stopped = self
            .call(method::STOP_FSRV, to_params(IdParams { id })?)
            .await?;
        Ok(data.new_stopped)
    }

    pub async fn list_fs(&self) -> Result<Vec<FileSystemItem>> {
        let data: data::FsList = self.call(method::LIST_FS, None).await?;
        Ok(data.fs_list)
    }

    pub async fn list_fsp(&self) -> Result<Vec<FileSystemProviderItem>> {
        let data: data::FspList = self.call(method::LIST_FSP, None).await?;
        Ok(data.fsp_list)
    }

    pub async fn list_fsrv(&self) -> Result<Vec<FServerItem>> {
        let data: data::FsrvList = self.call(method::LIST_FSRV, None).await?;
        Ok(data.fsrv_list)
    }

    pub async fn list_fsrvp(&self) -> Result<Vec<FServerProviderItem>> {
        let data: data::FsrvpList = self.call(method::LIST_FSRVP, None).await?;
        Ok(data.fsrvp_list)
    }

    pub async fn get_fs_info(&self, id: Uuid) -> Result<FileSystemInfo> {
        self.call(method::GET_FS_INFO, to_params(IdParams { id })?)
            .await
    }

    pub async fn get_fsrv_info(&self, id: Uuid) -> Result<FServerInfo> {
        self.call(method::GET_FSRV_INFO, to_params(IdParams { id })?)
            .await
    }

    /// Renames and/or reconfigures a filesystem. An empty or absent name and
    /// an absent config are left unchanged.
    pub async fn update_fs_info(
        &self,
        id: Uuid,
        name: Option<&str>,
        config: Option<Value>,
    ) -> Result<()> {
        let params = to_params(UpdateParams::new(id, name, config))?;
        self.call::<Value>(method::UPDATE_FS_INFO, params)
            .await
            .map(drop)
    }

    pub async fn update_fsrv_info(
        &self,
        id: Uuid,
        name: Option<&str>,
        config: Option<Value>,
    ) -> Result<()> {
        let params = to_params(UpdateParams::new(id, name, config))?;
        self.call::<Value>(method::UPDATE_FSRV_INFO, params)
            .await
            .map(drop)
    }
}
