use crate::ExportArtifact;
use crate::error::ExportError;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareChannel {
    #[default]
    Email,
    Messaging,
}

/// Where finished artifacts go: the device's downloads area, its share
/// sheet, and whatever opens `mailto:`/`https:` intents.
pub trait DistributionSurface {
    /// Stores `bytes` under `file_name` and returns where they landed.
    fn save(&self, file_name: &str, mime: &str, bytes: &[u8]) -> Result<String, ExportError>;

    fn native_share_available(&self) -> bool {
        false
    }

    fn share_natively(
        &self,
        artifact: &ExportArtifact,
        title: &str,
        text: &str,
    ) -> Result<(), ExportError>;

    fn open_intent(&self, uri: &str) -> Result<(), ExportError>;

    /// Human-readable status for the user.
    fn notify(&self, message: &str);

    fn fallback_channel(&self) -> ShareChannel {
        ShareChannel::Email
    }
}

pub fn download_file(surface: &dyn DistributionSurface, artifact: &ExportArtifact) -> bool {
    match surface.save(&artifact.file_name, artifact.mime_type(), &artifact.bytes) {
        Ok(location) => {
            log::debug!("[fieldexport][distribute] saved {} to {}", artifact.file_name, location);
            true
        }
        Err(err) => {
            let message = format!("Could not save {}: {}", artifact.file_name, err);
            log::error!("[fieldexport][distribute] {}", message);
            surface.notify(&message);
            false
        }
    }
}

/// Shares through the platform sheet when there is one; otherwise saves the
/// file and opens a compose intent that names it. Never fails loudly:
/// problems come back as `false` plus a message on the surface.
pub fn share_file(
    surface: &dyn DistributionSurface,
    artifact: &ExportArtifact,
    title: &str,
    text: &str,
) -> bool {
    if surface.native_share_available() {
        match surface.share_natively(artifact, title, text) {
            Ok(()) => return true,
            Err(err) => {
                log::warn!(
                    "[fieldexport][distribute] native share failed for {}: {}",
                    artifact.file_name,
                    err
                );
            }
        }
    }

    if !download_file(surface, artifact) {
        return false;
    }
    let intent = compose_intent(surface.fallback_channel(), &artifact.file_name, title, text);
    match surface.open_intent(&intent) {
        Ok(()) => true,
        Err(err) => {
            let message = format!(
                "{} was saved to your downloads but could not be shared: {}",
                artifact.file_name, err
            );
            log::error!("[fieldexport][distribute] {}", message);
            surface.notify(&message);
            false
        }
    }
}

pub fn compose_intent(channel: ShareChannel, file_name: &str, title: &str, text: &str) -> String {
    let note = format!("Attachment: {} (saved to downloads)", file_name);
    match channel {
        ShareChannel::Email => {
            let body = if text.trim().is_empty() {
                note
            } else {
                format!("{}\n\n{}", text, note)
            };
            format!(
                "mailto:?subject={}&body={}",
                urlencoding::encode(title),
                urlencoding::encode(&body)
            )
        }
        ShareChannel::Messaging => {
            let mut message = title.to_string();
            if !text.trim().is_empty() {
                message.push('\n');
                message.push_str(text);
            }
            message.push('\n');
            message.push_str(&note);
            format!("https://wa.me/?text={}", urlencoding::encode(&message))
        }
    }
}

/// Surface backed by a local directory. Opened intents and user messages are
/// recorded instead of acted on.
pub struct DirectorySurface {
    root: PathBuf,
    native_share: bool,
    channel: ShareChannel,
    intents: RefCell<Vec<String>>,
    messages: RefCell<Vec<String>>,
}

impl DirectorySurface {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            native_share: false,
            channel: ShareChannel::Email,
            intents: RefCell::new(Vec::new()),
            messages: RefCell::new(Vec::new()),
        }
    }

    /// Native sharing copies into `<root>/shared`.
    pub fn with_native_share(mut self, enabled: bool) -> Self {
        self.native_share = enabled;
        self
    }

    pub fn with_channel(mut self, channel: ShareChannel) -> Self {
        self.channel = channel;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn intents(&self) -> Vec<String> {
        self.intents.borrow().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }

    fn write_into(&self, dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf, ExportError> {
        let name = Path::new(file_name)
            .file_name()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ExportError::InvalidConfiguration(format!("invalid file name: {:?}", file_name))
            })?;
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        fs::write(&path, bytes)?;
        Ok(path)
    }
}

impl DistributionSurface for DirectorySurface {
    fn save(&self, file_name: &str, _mime: &str, bytes: &[u8]) -> Result<String, ExportError> {
        let path = self.write_into(&self.root, file_name, bytes)?;
        Ok(path.display().to_string())
    }

    fn native_share_available(&self) -> bool {
        self.native_share
    }

    fn share_natively(
        &self,
        artifact: &ExportArtifact,
        _title: &str,
        _text: &str,
    ) -> Result<(), ExportError> {
        self.write_into(&self.root.join("shared"), &artifact.file_name, &artifact.bytes)?;
        Ok(())
    }

    fn open_intent(&self, uri: &str) -> Result<(), ExportError> {
        self.intents.borrow_mut().push(uri.to_string());
        Ok(())
    }

    fn notify(&self, message: &str) {
        self.messages.borrow_mut().push(message.to_string());
    }

    fn fallback_channel(&self) -> ShareChannel {
        self.channel
    }
}
