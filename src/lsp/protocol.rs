use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::utils::error::LspError;

pub const JSONRPC_VERSION: &str = "2.0";

/// `file://` URI for a path, made absolute first.
pub fn file_uri(path: &Path) -> Result<String, LspError> {
    let absolute =
        std::path::absolute(path).map_err(|_| LspError::InvalidPath(path.to_path_buf()))?;
    Url::from_file_path(&absolute)
        .map(String::from)
        .map_err(|()| LspError::InvalidPath(absolute))
}

/// Local path named by a `file://` URI.
pub fn uri_to_path(uri: &str) -> Result<PathBuf, LspError> {
    Url::parse(uri)
        .ok()
        .filter(|url| url.scheme() == "file")
        .and_then(|url| url.to_file_path().ok())
        .ok_or_else(|| LspError::InvalidPath(PathBuf::from(uri)))
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    /// UTF-16 code units from the start of the line.
    pub character: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

/// Alternative shape servers may use for definition-like answers.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LocationLink {
    pub target_uri: String,
    pub target_range: Range,
    pub target_selection_range: Range,
}

impl From<LocationLink> for Location {
    fn from(link: LocationLink) -> Self {
        Self { uri: link.target_uri, range: link.target_selection_range }
    }
}

#[derive(Serialize, Deserialize)]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

#[derive(Serialize, Deserialize)]
pub struct TextDocumentPositionParams {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentIdentifier,
    pub position: Position,
}

#[derive(Serialize, Deserialize)]
pub struct ReferenceContext {
    #[serde(rename = "includeDeclaration")]
    pub include_declaration: bool,
}

#[derive(Serialize, Deserialize)]
pub struct ReferenceParams {
    #[serde(flatten)]
    pub text_document_position_params: TextDocumentPositionParams,
    pub context: ReferenceContext,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TextDocumentItem {
    pub uri: String,
    #[serde(rename = "languageId")]
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DidOpenTextDocumentParams {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentItem,
}

#[derive(Serialize)]
pub struct LSPRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

#[derive(Serialize)]
pub struct LSPNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: Value,
}

/// Reply to a request the server sent us.
#[derive(Serialize)]
pub struct LSPReply {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub result: Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LSPError {
    pub code: i64,
    pub message: String,
}

/// Any inbound frame: response, notification or server-initiated request.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LSPError>,
}

impl Message {
    /// The numeric ID of a response. Requests and notifications have none.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        self.id.as_ref().and_then(Value::as_u64)
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    pub fn is_server_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    /// Split a response into its result payload or the server's error.
    pub fn into_result(self) -> Result<Value, LspError> {
        if let Some(error) = self.error {
            return Err(LspError::Server { code: error.code, message: error.message });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Normalize a definition-like result into a list of locations.
///
/// Servers answer with `null`, a single `Location`, a `LocationLink`, or an
/// array of either. Shapes that fit none of these yield an empty list.
pub fn parse_locations(result: Value) -> Vec<Location> {
    match result {
        Value::Array(items) => items.into_iter().filter_map(parse_location).collect(),
        value @ Value::Object(_) => parse_location(value).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn parse_location(value: Value) -> Option<Location> {
    if value.get("targetUri").is_some() {
        return serde_json::from_value::<LocationLink>(value).ok().map(Location::from);
    }
    serde_json::from_value::<Location>(value).ok().filter(|loc| !loc.uri.is_empty())
}
