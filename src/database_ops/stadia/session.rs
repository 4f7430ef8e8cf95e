//! Google session credentials and the per-page tokens needed to sign batch calls.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use super::RpcError;
use crate::util::env::env_opt;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("missing google account id (set STADIA_GOOGLE_ID)")]
    MissingGoogleId,
    #[error("missing {0} cookie (set STADIA_COOKIES or STADIA_{0})")]
    MissingCookie(&'static str),
}

/// The three cookies Google uses to authenticate a signed-in browser session.
#[derive(Clone, PartialEq, Eq)]
pub struct GoogleCookies {
    pub sid: String,
    pub ssid: String,
    pub hsid: String,
}

impl GoogleCookies {
    pub fn new(sid: impl Into<String>, ssid: impl Into<String>, hsid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            ssid: ssid.into(),
            hsid: hsid.into(),
        }
    }

    /// Parse a `name=value; name=value` cookie string. Unknown cookies are ignored,
    /// missing ones come back empty.
    pub fn from_header(header: &str) -> Self {
        let mut cookies = Self::new("", "", "");
        for pair in header.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            match name.trim() {
                "SID" => cookies.sid = value.trim().to_string(),
                "SSID" => cookies.ssid = value.trim().to_string(),
                "HSID" => cookies.hsid = value.trim().to_string(),
                _ => {}
            }
        }
        cookies
    }

    pub fn header_value(&self) -> String {
        format!("SID={}; SSID={}; HSID={};", self.sid, self.ssid, self.hsid)
    }

    fn first_missing(&self) -> Option<&'static str> {
        [("SID", &self.sid), ("SSID", &self.ssid), ("HSID", &self.hsid)]
            .into_iter()
            .find(|(_, value)| value.is_empty())
            .map(|(name, _)| name)
    }
}

impl fmt::Debug for GoogleCookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleCookies")
            .field("sid", &"<redacted>")
            .field("ssid", &"<redacted>")
            .field("hsid", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GoogleSession {
    pub google_id: String,
    pub cookies: GoogleCookies,
}

/// Somewhere signed-in sessions can be found (configuration, a browser profile, ...).
pub trait SessionSource {
    fn discover_sessions(&self) -> Result<Vec<GoogleSession>, SessionError>;
}

/// Reads one session from `STADIA_GOOGLE_ID` plus either `STADIA_COOKIES`
/// or the individual `STADIA_SID` / `STADIA_SSID` / `STADIA_HSID` variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSessionSource;

impl SessionSource for EnvSessionSource {
    fn discover_sessions(&self) -> Result<Vec<GoogleSession>, SessionError> {
        let google_id = env_opt("STADIA_GOOGLE_ID").ok_or(SessionError::MissingGoogleId)?;
        let cookies = match env_opt("STADIA_COOKIES") {
            Some(header) => GoogleCookies::from_header(&header),
            None => GoogleCookies::new(
                env_opt("STADIA_SID").unwrap_or_default(),
                env_opt("STADIA_SSID").unwrap_or_default(),
                env_opt("STADIA_HSID").unwrap_or_default(),
            ),
        };
        if let Some(missing) = cookies.first_missing() {
            return Err(SessionError::MissingCookie(missing));
        }
        Ok(vec![GoogleSession { google_id, cookies }])
    }
}

/// Dynamic tokens embedded in the web app's `WIZ_global_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokens {
    /// Anti-forgery token, sent as the `at` form field.
    pub at: String,
    /// Backend release label, sent as `bl`.
    pub bl: String,
    /// Session id, sent as `f.sid`.
    pub f_sid: String,
}

pub const AT_KEY: &str = "SNlM0e";
pub const BL_KEY: &str = "cfb2h";
pub const F_SID_KEY: &str = "FdrFJe";

fn wiz_global_data() -> &'static Regex {
    static WIZ: OnceLock<Regex> = OnceLock::new();
    WIZ.get_or_init(|| {
        Regex::new(r"(?s)WIZ_global_data\s*=\s*(.+?);\s*</script>").expect("static regex")
    })
}

fn wiz_value(data: &str, key: &'static str) -> Result<String, RpcError> {
    let pattern = format!(r#""{}"\s*:\s*"((?:[^"\\]|\\.)*)""#, regex::escape(key));
    let re = Regex::new(&pattern).map_err(|_| RpcError::MissingToken(key))?;
    let raw = re
        .captures(data)
        .and_then(|c| c.get(1))
        .ok_or(RpcError::MissingToken(key))?;
    serde_json::from_str::<String>(&format!("\"{}\"", raw.as_str()))
        .map_err(|_| RpcError::MissingToken(key))
}

impl SessionTokens {
    /// Extract the tokens from a rendered page.
    pub fn from_page(html: &str) -> Result<Self, RpcError> {
        let data = wiz_global_data()
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or(RpcError::MissingToken("WIZ_global_data"))?;
        Ok(Self {
            at: wiz_value(data, AT_KEY)?,
            bl: wiz_value(data, BL_KEY)?,
            f_sid: wiz_value(data, F_SID_KEY)?,
        })
    }
}
