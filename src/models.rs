use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryTag {
    File,
    Folder,
    Deleted,
}

/// One item of a folder listing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Entry {
    #[serde(rename = ".tag")]
    pub tag: EntryTag,
    pub name: String,
    #[serde(default)]
    pub path_lower: String,
    #[serde(default)]
    pub path_display: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub size: u64,
    /// Account the entry was listed under, set when listing across accounts.
    #[serde(skip)]
    pub owner: Option<String>,
}

impl Entry {
    pub fn is_folder(&self) -> bool {
        self.tag == EntryTag::Folder
    }

    /// Path to use in follow-up requests.
    pub fn remote_path(&self) -> &str {
        if self.path_display.is_empty() {
            &self.path_lower
        } else {
            &self.path_display
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct FolderListing {
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub cursor: String,
    #[serde(default)]
    pub has_more: bool,
}

/// Position inside an upload session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub session_id: String,
    #[serde(default)]
    pub offset: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FileMetadata {
    #[serde(rename = ".tag", default)]
    pub tag: Option<EntryTag>,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path_display: String,
    #[serde(default)]
    pub path_lower: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub rev: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub client_modified: Option<String>,
    #[serde(default)]
    pub server_modified: Option<String>,
}

impl FileMetadata {
    pub fn is_folder(&self) -> bool {
        self.tag == Some(EntryTag::Folder)
    }
}

/// Wrapper used by create_folder_v2, move_v2 and delete_v2.
#[derive(Deserialize, Debug)]
pub struct MetadataResult {
    pub metadata: FileMetadata,
}

#[derive(Deserialize, Debug)]
pub struct TemporaryLink {
    pub metadata: FileMetadata,
    pub link: String,
}

#[derive(Deserialize, Debug)]
pub struct SearchResult {
    pub matches: Vec<SearchMatch>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Deserialize, Debug)]
pub struct SearchMatch {
    pub metadata: SearchMatchMetadata,
}

#[derive(Deserialize, Debug)]
pub struct SearchMatchMetadata {
    pub metadata: FileMetadata,
}

#[derive(Deserialize, Debug)]
pub struct AccountName {
    pub display_name: String,
}

#[derive(Deserialize, Debug)]
pub struct AccountInfo {
    pub account_id: String,
    pub name: AccountName,
    pub email: String,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct SpaceAllocation {
    #[serde(default)]
    pub allocated: u64,
}

#[derive(Deserialize, Debug)]
pub struct SpaceUsage {
    pub used: u64,
    pub allocation: SpaceAllocation,
}

/// How a single file download is carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Stream the body with one request.
    Internal,
    /// Split into byte ranges fetched concurrently.
    Fast,
    /// Delegate to aria2c.
    Aria,
}

#[derive(Clone, Debug)]
pub struct TransferJob {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
    pub strategy: Strategy,
}
