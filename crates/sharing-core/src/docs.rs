//! File and directory records of the virtual file system.
//!
//! Records are stored as plain JSON bodies in the files doctype, with a
//! `"type"` field set to `"file"` or `"directory"`. `_id` and `_rev` are not
//! part of the body: they come from the store.

use crate::store::StoredDoc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Id of the root directory
pub const ROOT_DIR_ID: &str = "io.cozy.files.root-dir";
/// Id of the trash directory
pub const TRASH_DIR_ID: &str = "io.cozy.files.trash-dir";
/// Full path of the trash directory
pub const TRASH_DIR_PATH: &str = "/.cozy_trash";

pub const FILE_TYPE: &str = "file";
pub const DIR_TYPE: &str = "directory";

/// A reference from a file to another document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocReference {
    #[serde(rename = "type")]
    pub doctype: String,
    pub id: String,
}

/// A file record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDoc {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub rev: String,
    pub name: String,
    pub dir_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Size in bytes, serialized as a string
    #[serde(with = "size_as_string")]
    pub size: u64,
    #[serde(default)]
    pub md5sum: String,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub executable: bool,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_by: Vec<DocReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(
        rename = "cozyMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cozy_metadata: Option<Value>,
    #[serde(
        rename = "internal_vfs_id",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub internal_id: String,
}

impl FileDoc {
    /// New file in `dir_id`, created and updated at `now`.
    pub fn new(id: &str, name: &str, dir_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            rev: String::new(),
            name: name.to_string(),
            dir_id: dir_id.to_string(),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            size: 0,
            md5sum: String::new(),
            mime: String::new(),
            class: String::new(),
            executable: false,
            trashed: false,
            referenced_by: Vec::new(),
            metadata: None,
            cozy_metadata: None,
            internal_id: String::new(),
        }
    }

    /// JSON body as written to the store.
    pub fn to_body(&self) -> serde_json::Result<Value> {
        with_type(serde_json::to_value(self)?, FILE_TYPE)
    }

    /// Body plus `_id`/`_rev`, as carried by realtime events.
    pub fn to_json(&self) -> serde_json::Result<Value> {
        with_identity(self.to_body()?, &self.id, &self.rev)
    }

    pub fn from_stored(doc: StoredDoc) -> serde_json::Result<Self> {
        let mut file: FileDoc = serde_json::from_value(doc.body)?;
        file.id = doc.id;
        file.rev = doc.rev;
        Ok(file)
    }
}

/// A directory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirDoc {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub rev: String,
    pub name: String,
    #[serde(default)]
    pub dir_id: String,
    /// Full path of the directory
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_by: Vec<DocReference>,
    #[serde(
        rename = "cozyMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cozy_metadata: Option<Value>,
}

impl DirDoc {
    /// New directory `name` inside `parent`.
    pub fn new(id: &str, name: &str, parent: &DirDoc, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            rev: String::new(),
            name: name.to_string(),
            dir_id: parent.id.clone(),
            path: join_path(&parent.path, name),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            referenced_by: Vec::new(),
            cozy_metadata: None,
        }
    }

    pub fn root(now: DateTime<Utc>) -> Self {
        Self {
            id: ROOT_DIR_ID.to_string(),
            rev: String::new(),
            name: String::new(),
            dir_id: String::new(),
            path: "/".to_string(),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            referenced_by: Vec::new(),
            cozy_metadata: None,
        }
    }

    pub fn trash(now: DateTime<Utc>) -> Self {
        Self {
            id: TRASH_DIR_ID.to_string(),
            rev: String::new(),
            name: ".cozy_trash".to_string(),
            dir_id: ROOT_DIR_ID.to_string(),
            path: TRASH_DIR_PATH.to_string(),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            referenced_by: Vec::new(),
            cozy_metadata: None,
        }
    }

    pub fn to_body(&self) -> serde_json::Result<Value> {
        with_type(serde_json::to_value(self)?, DIR_TYPE)
    }

    pub fn to_json(&self) -> serde_json::Result<Value> {
        with_identity(self.to_body()?, &self.id, &self.rev)
    }

    pub fn from_stored(doc: StoredDoc) -> serde_json::Result<Self> {
        let mut dir: DirDoc = serde_json::from_value(doc.body)?;
        dir.id = doc.id;
        dir.rev = doc.rev;
        Ok(dir)
    }
}

/// Either a directory or a file.
#[derive(Debug, Clone, PartialEq)]
pub enum DirOrFile {
    Dir(DirDoc),
    File(FileDoc),
}

impl DirOrFile {
    pub fn id(&self) -> &str {
        match self {
            DirOrFile::Dir(d) => &d.id,
            DirOrFile::File(f) => &f.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DirOrFile::Dir(d) => &d.name,
            DirOrFile::File(f) => &f.name,
        }
    }

    pub fn dir_id(&self) -> &str {
        match self {
            DirOrFile::Dir(d) => &d.dir_id,
            DirOrFile::File(f) => &f.dir_id,
        }
    }

    /// Decode a stored body according to its `"type"` field.
    pub fn from_stored(doc: StoredDoc) -> serde_json::Result<Self> {
        match doc.body.get("type").and_then(Value::as_str) {
            Some(DIR_TYPE) => Ok(DirOrFile::Dir(DirDoc::from_stored(doc)?)),
            _ => Ok(DirOrFile::File(FileDoc::from_stored(doc)?)),
        }
    }
}

/// Join a directory path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Split a path into its parent path and final name.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let pos = trimmed.rfind('/')?;
    let name = &trimmed[pos + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if pos == 0 { "/" } else { &trimmed[..pos] };
    Some((parent, name))
}

fn with_type(mut body: Value, doc_type: &str) -> serde_json::Result<Value> {
    if let Value::Object(map) = &mut body {
        map.insert("type".to_string(), Value::String(doc_type.to_string()));
    }
    Ok(body)
}

fn with_identity(body: Value, id: &str, rev: &str) -> serde_json::Result<Value> {
    let mut map = match body {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    map.insert("_id".to_string(), Value::String(id.to_string()));
    if !rev.is_empty() {
        map.insert("_rev".to_string(), Value::String(rev.to_string()));
    }
    Ok(Value::Object(map))
}

/// The `size` of a file is stored as a decimal string, but older records may
/// hold a number.
mod size_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(size: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&size.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Size {
            Text(String),
            Number(u64),
        }

        match Size::deserialize(d)? {
            Size::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Size::Number(n) => Ok(n),
        }
    }
}
