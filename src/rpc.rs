//! Inter-node RPC client.
//!
//! Builds authenticated requests to peer sockets and parses the generic
//! envelope back.  Every request carries the static
//! `X-Authorization-Token`; once this process holds a registered id it
//! also sends `X-Node-ID` and `X-Node-Port` so the peer can recognize the
//! caller.  Bodies are streamed; nothing is sized from `Content-Length`.
//!
//! Error mapping: a request that cannot be constructed is
//! [`NodeError::RequestInvalid`]; a transport failure (timeout, refused,
//! DNS) is [`NodeError::RequestResponseError`]; a well-formed non-200
//! answer is [`NodeError::MasterValidButRefused`].

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::envelope::Generic;
use crate::errors::NodeError;
use crate::store::records::{NodeRecord, RegisteredNodeInfo};

/// Header carrying the static inter-node token.
pub const HEADER_AUTHORIZATION_TOKEN: &str = "X-Authorization-Token";
/// Header carrying the caller's registered node id.
pub const HEADER_NODE_ID: &str = "X-Node-ID";
/// Header carrying the caller's listen port.
pub const HEADER_NODE_PORT: &str = "X-Node-Port";

/// Static bearer token shared by every fleet member.
pub const AUTHORIZATION_TOKEN: &str =
    "$2a$04$Vd1l0y9PDmVcM7qZJbWnduTrLoAVyyuaIlWOvmFnqq8R2bc6T4bUK";

/// Fixed per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// -- Endpoint URLs -----------------------------------------------------------

fn url_status(socket: &str) -> String {
    format!("http://{socket}/server")
}

fn url_master_status(socket: &str) -> String {
    format!("http://{socket}/server/master")
}

fn url_master_notify(socket: &str) -> String {
    format!("http://{socket}/server/master/notify")
}

fn url_slave_status(socket: &str) -> String {
    format!("http://{socket}/server/slave")
}

fn url_slave_notify_takeover(socket: &str) -> String {
    format!("http://{socket}/server/slave/notify/takeover")
}

fn url_slave_notify_switch_superior(socket: &str) -> String {
    format!("http://{socket}/server/slave/notify/switch_superior")
}

// -- Wire payloads -----------------------------------------------------------

/// Data section of a master status response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterStatusData {
    /// The master's own socket as it sees the request.
    #[serde(default)]
    pub host: String,
    /// The caller's IP as the master observed it.
    #[serde(default)]
    pub client_ip: String,
    /// The caller's remote address (socket).
    #[serde(default)]
    pub remote_addr: String,
    /// Whether the master recognizes the caller as one of its slaves.
    #[serde(default)]
    pub attended: bool,
    #[serde(default)]
    pub is_master_working: bool,
    #[serde(default)]
    pub is_slave_working: bool,
}

/// Extension section of a master status response: the roster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterStatusExt {
    #[serde(default)]
    pub master: Option<RegisteredNodeInfo>,
    #[serde(default)]
    pub slaves: Option<HashMap<u64, RegisteredNodeInfo>>,
}

/// Full master status envelope.
pub type MasterStatusResponse = Generic<MasterStatusData, MasterStatusExt>;

/// Data section of an admission response: the freshly assigned record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveRegistrationData {
    pub id: u64,
    pub name: String,
    pub node_version: String,
    pub host: String,
    pub port: u16,
    pub turn: u64,
}

/// Full admission envelope.
pub type SlaveRegistrationResponse = Generic<SlaveRegistrationData, serde_json::Value>;

// -- Client ------------------------------------------------------------------

/// HTTP client for peer-to-peer calls.
#[derive(Debug, Clone, Default)]
pub struct NodeClient {
    http: reqwest::Client,
}

impl NodeClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Prepare a request with the fixed deadline and identity headers.
    fn prepare(&self, method: Method, url: String, me: &NodeRecord) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .timeout(REQUEST_TIMEOUT)
            .header(HEADER_AUTHORIZATION_TOKEN, AUTHORIZATION_TOKEN);
        if me.id != 0 {
            builder = builder
                .header(HEADER_NODE_ID, me.id.to_string())
                .header(HEADER_NODE_PORT, me.port.to_string());
        }
        builder
    }

    /// Build and dispatch, splitting construction failures from
    /// transport failures.
    async fn execute(&self, builder: RequestBuilder) -> Result<Response, NodeError> {
        let request = builder.build().map_err(|e| {
            warn!("failed to build node request: {e}");
            NodeError::RequestInvalid
        })?;
        self.http.execute(request).await.map_err(|e| {
            debug!("node request failed: {e}");
            NodeError::RequestResponseError
        })
    }

    /// Drain a non-OK response for logging and return the refusal error.
    async fn refused(resp: Response) -> NodeError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        debug!("peer refused: status={status} body={body}");
        NodeError::MasterValidButRefused
    }

    /// `GET /server/master` — probe the master's status.
    pub async fn master_status(
        &self,
        me: &NodeRecord,
        master: &NodeRecord,
    ) -> Result<MasterStatusResponse, NodeError> {
        let resp = self
            .execute(self.prepare(Method::GET, url_master_status(&master.socket()), me))
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Self::refused(resp).await);
        }
        resp.json::<MasterStatusResponse>()
            .await
            .map_err(|_| NodeError::RequestResponseError)
    }

    /// `PUT /server/master/notify` — ask the master to add the caller as
    /// a slave.  Returns the freshly assigned registration.
    pub async fn notify_master_to_add(
        &self,
        me: &NodeRecord,
        master: &NodeRecord,
    ) -> Result<SlaveRegistrationData, NodeError> {
        let resp = self
            .execute(
                self.prepare(Method::PUT, url_master_notify(&master.socket()), me)
                    .form(&me.fresh_info()),
            )
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Self::refused(resp).await);
        }
        let envelope = resp
            .json::<SlaveRegistrationResponse>()
            .await
            .map_err(|_| NodeError::RequestResponseError)?;
        envelope.data.ok_or(NodeError::RequestResponseError)
    }

    /// `DELETE /server/master/notify?...` — ask the master to remove the
    /// caller.
    pub async fn notify_master_to_remove(
        &self,
        me: &NodeRecord,
        master: &NodeRecord,
    ) -> Result<(), NodeError> {
        let url = format!(
            "{}?id={}&{}",
            url_master_notify(&master.socket()),
            me.id,
            me.fresh_info().encode()
        );
        let resp = self
            .execute(self.prepare(Method::DELETE, url, me))
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Self::refused(resp).await);
        }
        Ok(())
    }

    /// `GET /server/slave` — probe a slave's liveness.
    pub async fn slave_status(&self, me: &NodeRecord, slave: &NodeRecord) -> Result<(), NodeError> {
        let resp = self
            .execute(self.prepare(Method::GET, url_slave_status(&slave.socket()), me))
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Self::refused(resp).await);
        }
        Ok(())
    }

    /// `GET /server` — probe any node's generic status.
    pub async fn node_status(&self, me: &NodeRecord, node: &NodeRecord) -> Result<(), NodeError> {
        let resp = self
            .execute(self.prepare(Method::GET, url_status(&node.socket()), me))
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Self::refused(resp).await);
        }
        Ok(())
    }

    /// `POST /server/slave/notify/takeover` — instruct `slave` to take
    /// over from the departing master (the caller).
    pub async fn notify_slave_to_takeover(
        &self,
        me: &NodeRecord,
        slave: &NodeRecord,
    ) -> Result<(), NodeError> {
        let resp = self
            .execute(
                self.prepare(
                    Method::POST,
                    url_slave_notify_takeover(&slave.socket()),
                    me,
                )
                .form(&me.to_registered(0)),
            )
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Self::refused(resp).await);
        }
        Ok(())
    }

    /// `POST /server/slave/notify/switch_superior` — instruct `slave` to
    /// adopt `new_master` as its superior.
    pub async fn notify_slave_to_switch_superior(
        &self,
        me: &NodeRecord,
        slave: &NodeRecord,
        new_master: &RegisteredNodeInfo,
    ) -> Result<(), NodeError> {
        let resp = self
            .execute(
                self.prepare(
                    Method::POST,
                    url_slave_notify_switch_superior(&slave.socket()),
                    me,
                )
                .form(new_master),
            )
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Self::refused(resp).await);
        }
        Ok(())
    }
}
