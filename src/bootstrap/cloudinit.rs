//! Typed cloud-init builder
//!
//! Scale-set members receive their first-boot configuration as a
//! `#cloud-config` payload: pinned PKI material and config files written
//! with mode 0644, bootstrap scripts written with mode 0755 and executed via
//! `runcmd`. The builder renders deterministically (files sorted by path,
//! commands in insertion order) so re-running a bootstrap step produces
//! byte-identical custom data.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

/// File entry in the rendered payload
#[derive(Clone, Debug, Serialize, PartialEq)]
struct WriteFile {
    path: String,
    permissions: String,
    encoding: String,
    owner: String,
    content: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
struct Payload {
    write_files: Vec<WriteFile>,
    runcmd: Vec<String>,
}

/// Builder for a `#cloud-config` payload
#[derive(Clone, Debug, Default)]
pub struct CloudInit {
    files: BTreeMap<String, (String, String)>,
    scripts: Vec<String>,
}

impl CloudInit {
    /// Start an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a data file written with mode 0644
    pub fn data_file(mut self, path: impl Into<String>, contents: impl AsRef<[u8]>) -> Self {
        self.files.insert(
            path.into(),
            ("0644".to_string(), STANDARD.encode(contents.as_ref())),
        );
        self
    }

    /// Add a script written with mode 0755 and executed on first boot
    pub fn script_file(mut self, path: impl Into<String>, contents: impl AsRef<[u8]>) -> Self {
        let path = path.into();
        self.files.insert(
            path.clone(),
            ("0755".to_string(), STANDARD.encode(contents.as_ref())),
        );
        self.scripts.push(path);
        self
    }

    /// Render the `#cloud-config` YAML
    pub fn render(&self) -> String {
        let payload = Payload {
            write_files: self
                .files
                .iter()
                .map(|(path, (permissions, content))| WriteFile {
                    path: path.clone(),
                    permissions: permissions.clone(),
                    encoding: "base64".to_string(),
                    owner: "root".to_string(),
                    content: content.clone(),
                })
                .collect(),
            runcmd: self.scripts.iter().map(|path| format!("sudo {path}")).collect(),
        };
        // Payload serialization cannot fail: plain strings and vectors only.
        let body = serde_yaml::to_string(&payload).expect("cloud-init payload serializes");
        format!("#cloud-config\n{body}")
    }

    /// Render and base64-encode, ready for the scale-set customData field
    pub fn encode(&self) -> String {
        STANDARD.encode(self.render())
    }
}
