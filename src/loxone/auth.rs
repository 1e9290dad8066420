//! Token-based authentication handshake.
//!
//! 1. `jdev/sys/getkey2/{user}` returns a one-time key, the user's salt
//!    and the hash algorithm.
//! 2. The password is hashed with the salt, then HMAC'd together with the
//!    user name using the one-time key.
//! 3. `jdev/sys/getjwt/...` exchanges the HMAC for a token.
//!
//! The plaintext password never leaves the process.

use super::CommandSink;
use super::crypto::{HashAlgorithm, compute_auth_code, hash_password};
use super::response::{LoxResponse, RESPONSE_TIMEOUT, ResponseQueue};
use crate::error::{BridgeError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Permission level requested for the token (2 = web).
const TOKEN_PERMISSION: u8 = 2;

/// Fixed client identifier so the Miniserver sees the bridge as one client.
pub const CLIENT_UUID: &str = "50325345-5200-0000-0000-000000000000";

/// Label shown in the Miniserver's token list.
pub const CLIENT_INFO: &str = "LoxoneMQTTBridge";

/// One-time key material from `getkey2`.
#[derive(Debug, Clone, Deserialize)]
struct KeyInfo {
    key: String,
    salt: String,
    #[serde(rename = "hashAlg", default)]
    hash_alg: String,
}

/// Session token returned by `getjwt`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub token: String,
    #[serde(default)]
    pub valid_until: i64,
    #[serde(default)]
    pub token_rights: i64,
    #[serde(default)]
    pub unsecure_pass: bool,
    #[serde(default)]
    pub key: String,
}

/// User credentials for the handshake.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn ensure_ok(response: &LoxResponse, command: &str) -> Result<()> {
    match response.code() {
        Some(code) if code != 200 => Err(BridgeError::AuthRejected {
            command: command.to_string(),
            code,
        }),
        _ => Ok(()),
    }
}

/// Run the handshake and return the session token.
///
/// Any failure aborts the whole handshake; nothing is kept from a partial run.
pub async fn authenticate(
    sink: &dyn CommandSink,
    responses: &ResponseQueue,
    credentials: &Credentials,
) -> Result<Token> {
    let user = &credentials.user;

    sink.send_command(&format!("jdev/sys/getkey2/{}", user)).await?;
    let response = responses.wait_for("getkey2", RESPONSE_TIMEOUT).await?;
    ensure_ok(&response, "getkey2")?;
    let key_info: KeyInfo = response.value_as()?;

    let alg = HashAlgorithm::from(key_info.hash_alg.as_str());
    debug!("Received key material, hash algorithm {:?}", alg);

    let pw_hash = hash_password(&credentials.password, &key_info.salt, alg);
    let auth_code = compute_auth_code(&key_info.key, &format!("{}:{}", user, pw_hash), alg)?;

    let token_cmd = format!(
        "jdev/sys/getjwt/{}/{}/{}/{}/{}",
        auth_code, user, TOKEN_PERMISSION, CLIENT_UUID, CLIENT_INFO
    );
    sink.send_command(&token_cmd).await?;
    let response = responses.wait_for("getjwt", RESPONSE_TIMEOUT).await?;
    ensure_ok(&response, "getjwt")?;
    let token: Token = response.value_as()?;

    info!("Authentication successful");
    Ok(token)
}
