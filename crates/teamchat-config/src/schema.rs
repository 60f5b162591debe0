//! Shape of the persisted `.teamchatrc` credential cache (§6).
//!
//! The core client never reads this file directly — it is the CLI's
//! mechanism for remembering a login across invocations.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TeamchatRc {
    #[serde(default)]
    pub user: Option<UserBlock>,
    #[serde(default)]
    pub rooms: Vec<serde_json::Value>,
    #[serde(default)]
    pub people: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserBlock {
    pub api: ApiBlock,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiBlock {
    pub installation: String,
    #[serde(with = "secret_string")]
    pub auth: SecretString,
}

/// `secrecy::SecretString` deliberately never implements `Deserialize` —
/// round-trip it through a plain `String` instead, since the auth token
/// is the whole point of the persisted file.
mod secret_string {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &SecretString, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(value.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<SecretString, D::Error> {
        Ok(SecretString::from(String::deserialize(de)?))
    }
}
