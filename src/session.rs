use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Time-ordered id, so sessions sort by creation in the store.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    ReadyToSign,
    Signed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Draft => "draft",
            SessionStatus::ReadyToSign => "ready_to_sign",
            SessionStatus::Signed => "signed",
        }
    }

    fn rank(self) -> u8 {
        match self {
            SessionStatus::Draft => 0,
            SessionStatus::ReadyToSign => 1,
            SessionStatus::Signed => 2,
        }
    }

    /// Status never moves backwards.
    pub fn can_advance_to(self, next: SessionStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group of child records that share one signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSession {
    pub id: SessionId,
    pub child_record_ids: BTreeSet<RecordId>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl SignatureSession {
    pub fn contains(&self, record: &RecordId) -> bool {
        self.child_record_ids.contains(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Record,
    Session,
}

/// What a signature is attached to: one record on its own, or a session
/// covering several records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SignatureTarget {
    Record(RecordId),
    Session(SessionId),
}

impl SignatureTarget {
    pub fn target_kind(&self) -> TargetKind {
        match self {
            SignatureTarget::Record(_) => TargetKind::Record,
            SignatureTarget::Session(_) => TargetKind::Session,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            SignatureTarget::Record(id) => id.as_str(),
            SignatureTarget::Session(id) => id.as_str(),
        }
    }
}

impl fmt::Display for SignatureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureTarget::Record(id) => write!(f, "record {}", id),
            SignatureTarget::Session(id) => write!(f, "session {}", id),
        }
    }
}

/// Captured signature. There is no update or delete operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub target: SignatureTarget,
    // Encoded image as captured by the signing pad, usually a data URI.
    pub image_data: String,
    pub signer_name: Option<String>,
    pub signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    EmptySession,
    EmptyImage,
    AlreadySigned(SignatureTarget),
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    NotEditable(SessionStatus),
    RecordAlreadyGrouped {
        record: RecordId,
        session: SessionId,
    },
    MemberAlreadySigned(RecordId),
    UnknownSession(SessionId),
    Storage(String),
}

impl SignatureError {
    pub fn code(&self) -> &'static str {
        match self {
            SignatureError::EmptySession => "EMPTY_SESSION",
            SignatureError::EmptyImage => "EMPTY_IMAGE",
            SignatureError::AlreadySigned(_) => "ALREADY_SIGNED",
            SignatureError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SignatureError::NotEditable(_) => "NOT_EDITABLE",
            SignatureError::RecordAlreadyGrouped { .. } => "RECORD_ALREADY_GROUPED",
            SignatureError::MemberAlreadySigned(_) => "MEMBER_ALREADY_SIGNED",
            SignatureError::UnknownSession(_) => "UNKNOWN_SESSION",
            SignatureError::Storage(_) => "STORAGE",
        }
    }
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::EmptySession => {
                write!(f, "a signature session needs at least one record")
            }
            SignatureError::EmptyImage => write!(f, "signature image is empty"),
            SignatureError::AlreadySigned(target) => write!(f, "{} is already signed", target),
            SignatureError::InvalidTransition { from, to } => {
                write!(f, "session cannot move from {} to {}", from, to)
            }
            SignatureError::NotEditable(status) => {
                write!(f, "session membership is fixed once {}", status)
            }
            SignatureError::RecordAlreadyGrouped { record, session } => {
                write!(f, "record {} already belongs to session {}", record, session)
            }
            SignatureError::MemberAlreadySigned(record) => {
                write!(f, "record {} already carries its own signature", record)
            }
            SignatureError::UnknownSession(id) => write!(f, "unknown session {}", id),
            SignatureError::Storage(msg) => write!(f, "signature store error: {}", msg),
        }
    }
}

impl std::error::Error for SignatureError {}

impl From<serde_json::Error> for SignatureError {
    fn from(err: serde_json::Error) -> Self {
        SignatureError::Storage(err.to_string())
    }
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Persistence for sessions and signatures. Each write is a single atomic
/// write; there is no compare-and-set, so concurrent writers race and the
/// later write wins.
pub trait SignatureStore {
    fn read_session(&self, id: &SessionId) -> Result<Option<SignatureSession>, SignatureError>;
    fn write_session(&self, session: &SignatureSession) -> Result<(), SignatureError>;
    fn read_signature(&self, target: &SignatureTarget) -> Result<Option<Signature>, SignatureError>;
    fn write_signature(&self, signature: &Signature) -> Result<(), SignatureError>;
    fn session_id_for_record(&self, record: &RecordId) -> Result<Option<SessionId>, SignatureError>;
}

impl<T: SignatureStore + ?Sized> SignatureStore for Arc<T> {
    fn read_session(&self, id: &SessionId) -> Result<Option<SignatureSession>, SignatureError> {
        (**self).read_session(id)
    }

    fn write_session(&self, session: &SignatureSession) -> Result<(), SignatureError> {
        (**self).write_session(session)
    }

    fn read_signature(
        &self,
        target: &SignatureTarget,
    ) -> Result<Option<Signature>, SignatureError> {
        (**self).read_signature(target)
    }

    fn write_signature(&self, signature: &Signature) -> Result<(), SignatureError> {
        (**self).write_signature(signature)
    }

    fn session_id_for_record(
        &self,
        record: &RecordId,
    ) -> Result<Option<SessionId>, SignatureError> {
        (**self).session_id_for_record(record)
    }
}

/// In-process store. Documents are kept as JSON, the shape a remote document
/// store would hold them in.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: BTreeMap<SessionId, String>,
    signatures: BTreeMap<SignatureTarget, String>,
    record_index: BTreeMap<RecordId, SessionId>,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.lock().map(|state| state.sessions.len()).unwrap_or(0)
    }

    pub fn signature_count(&self) -> usize {
        self.lock().map(|state| state.signatures.len()).unwrap_or(0)
    }

    pub fn write_count(&self) -> usize {
        self.lock().map(|state| state.writes).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, SignatureError> {
        self.inner
            .lock()
            .map_err(|_| SignatureError::Storage("memory store poisoned".to_string()))
    }
}

impl SignatureStore for MemoryStore {
    fn read_session(&self, id: &SessionId) -> Result<Option<SignatureSession>, SignatureError> {
        let state = self.lock()?;
        match state.sessions.get(id) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn write_session(&self, session: &SignatureSession) -> Result<(), SignatureError> {
        let raw = serde_json::to_string(session)?;
        let mut state = self.lock()?;
        state.record_index.retain(|_, owner| owner != &session.id);
        for record in &session.child_record_ids {
            state.record_index.insert(record.clone(), session.id.clone());
        }
        state.sessions.insert(session.id.clone(), raw);
        state.writes += 1;
        Ok(())
    }

    fn read_signature(
        &self,
        target: &SignatureTarget,
    ) -> Result<Option<Signature>, SignatureError> {
        let state = self.lock()?;
        match state.signatures.get(target) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn write_signature(&self, signature: &Signature) -> Result<(), SignatureError> {
        let raw = serde_json::to_string(signature)?;
        let mut state = self.lock()?;
        state.signatures.insert(signature.target.clone(), raw);
        state.writes += 1;
        Ok(())
    }

    fn session_id_for_record(
        &self,
        record: &RecordId,
    ) -> Result<Option<SessionId>, SignatureError> {
        Ok(self.lock()?.record_index.get(record).cloned())
    }
}

/// The signature that applies to a record, and how it was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSignature {
    pub signature: Signature,
    pub via: TargetKind,
    pub session_id: Option<SessionId>,
}

/// What the signing screen may offer for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningGate {
    pub can_export: bool,
    pub can_sign: bool,
    // Where a new signature for this record has to be attached.
    pub sign_target: SignatureTarget,
}

pub struct SignatureSessionManager<S: SignatureStore> {
    store: S,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl<S: SignatureStore> SignatureSessionManager<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Starts a `Draft` session over `child_record_ids`. Nothing is written
    /// when the set is empty or any record is already in a session.
    pub fn create(
        &self,
        child_record_ids: impl IntoIterator<Item = RecordId>,
    ) -> Result<SignatureSession, SignatureError> {
        let children: BTreeSet<RecordId> = child_record_ids.into_iter().collect();
        if children.is_empty() {
            return Err(SignatureError::EmptySession);
        }
        for record in &children {
            self.ensure_ungrouped(record)?;
        }
        let session = SignatureSession {
            id: SessionId::generate(),
            child_record_ids: children,
            status: SessionStatus::Draft,
            created_at: self.clock.now(),
        };
        self.store.write_session(&session)?;
        log::debug!(
            "[fieldexport][session] created {} with {} records",
            session.id,
            session.child_record_ids.len()
        );
        Ok(session)
    }

    pub fn mark_ready_to_sign(
        &self,
        session_id: &SessionId,
    ) -> Result<SignatureSession, SignatureError> {
        let mut session = self.load_session(session_id)?;
        match session.status {
            SessionStatus::Draft => {
                session.status = SessionStatus::ReadyToSign;
                self.store.write_session(&session)?;
                Ok(session)
            }
            SessionStatus::ReadyToSign => Ok(session),
            SessionStatus::Signed => Err(SignatureError::InvalidTransition {
                from: SessionStatus::Signed,
                to: SessionStatus::ReadyToSign,
            }),
        }
    }

    /// Attaches the one signature `target` will ever carry. A session may be
    /// signed from `Draft` or `ReadyToSign`; a record that belongs to a
    /// session is signed through that session instead.
    pub fn attach_signature(
        &self,
        target: &SignatureTarget,
        image_data: impl Into<String>,
        signer_name: Option<String>,
    ) -> Result<Signature, SignatureError> {
        let image_data = image_data.into();
        if image_data.trim().is_empty() {
            return Err(SignatureError::EmptyImage);
        }
        if self.store.read_signature(target)?.is_some() {
            return Err(SignatureError::AlreadySigned(target.clone()));
        }

        let session = match target {
            SignatureTarget::Session(id) => {
                let session = self.load_session(id)?;
                if session.status == SessionStatus::Signed {
                    return Err(SignatureError::AlreadySigned(target.clone()));
                }
                Some(session)
            }
            SignatureTarget::Record(record) => {
                self.ensure_ungrouped(record)?;
                None
            }
        };

        let signature = Signature {
            target: target.clone(),
            image_data,
            signer_name: signer_name.filter(|name| !name.trim().is_empty()),
            signed_at: self.clock.now(),
        };
        // Lock the session before the signature lands so a failed write can
        // never leave a signed session that is still editable.
        if let Some(previous) = &session {
            let mut locked = previous.clone();
            locked.status = SessionStatus::Signed;
            self.store.write_session(&locked)?;
        }
        if let Err(err) = self.store.write_signature(&signature) {
            if let Some(previous) = &session {
                if let Err(rollback) = self.store.write_session(previous) {
                    log::error!(
                        "[fieldexport][session] {} stays locked without a signature: {}",
                        previous.id,
                        rollback
                    );
                }
            }
            return Err(err);
        }
        log::debug!("[fieldexport][session] signed {}", target);
        Ok(signature)
    }

    pub fn add_record(
        &self,
        session_id: &SessionId,
        record: RecordId,
    ) -> Result<SignatureSession, SignatureError> {
        let mut session = self.editable_session(session_id)?;
        if session.contains(&record) {
            return Ok(session);
        }
        self.ensure_ungrouped(&record)?;
        session.child_record_ids.insert(record);
        self.store.write_session(&session)?;
        Ok(session)
    }

    /// Removing the last record is refused; a session is never empty.
    pub fn remove_record(
        &self,
        session_id: &SessionId,
        record: &RecordId,
    ) -> Result<SignatureSession, SignatureError> {
        let mut session = self.editable_session(session_id)?;
        if !session.contains(record) {
            return Ok(session);
        }
        if session.child_record_ids.len() == 1 {
            return Err(SignatureError::EmptySession);
        }
        session.child_record_ids.remove(record);
        self.store.write_session(&session)?;
        Ok(session)
    }

    /// A batch of one is signed directly by its record id; a larger batch
    /// gets a session.
    pub fn register_batch(
        &self,
        record_ids: impl IntoIterator<Item = RecordId>,
    ) -> Result<SignatureTarget, SignatureError> {
        let records: BTreeSet<RecordId> = record_ids.into_iter().collect();
        match records.len() {
            0 => Err(SignatureError::EmptySession),
            1 => {
                let record = records.into_iter().next().ok_or(SignatureError::EmptySession)?;
                self.ensure_ungrouped(&record)?;
                Ok(SignatureTarget::Record(record))
            }
            _ => Ok(SignatureTarget::Session(self.create(records)?.id)),
        }
    }

    /// Groups records that were created independently. A record that already
    /// carries its own signature is refused rather than merged.
    pub fn group_existing(
        &self,
        record_ids: impl IntoIterator<Item = RecordId>,
    ) -> Result<SignatureSession, SignatureError> {
        let records: BTreeSet<RecordId> = record_ids.into_iter().collect();
        for record in &records {
            let direct = SignatureTarget::Record(record.clone());
            if self.store.read_signature(&direct)?.is_some() {
                return Err(SignatureError::MemberAlreadySigned(record.clone()));
            }
        }
        self.create(records)
    }

    pub fn get_by_record_id(&self, record: &RecordId) -> Result<Option<Signature>, SignatureError> {
        self.store
            .read_signature(&SignatureTarget::Record(record.clone()))
    }

    pub fn get_by_session_id(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Signature>, SignatureError> {
        self.store
            .read_signature(&SignatureTarget::Session(session_id.clone()))
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<Option<SignatureSession>, SignatureError> {
        self.store.read_session(session_id)
    }

    pub fn session_for_record(
        &self,
        record: &RecordId,
    ) -> Result<Option<SignatureSession>, SignatureError> {
        match self.store.session_id_for_record(record)? {
            Some(id) => self.store.read_session(&id),
            None => Ok(None),
        }
    }

    /// The signature covering `record`, whether attached to the record itself
    /// or to the session it belongs to.
    pub fn resolve_for_record(
        &self,
        record: &RecordId,
    ) -> Result<Option<ResolvedSignature>, SignatureError> {
        if let Some(signature) = self.get_by_record_id(record)? {
            return Ok(Some(ResolvedSignature {
                signature,
                via: TargetKind::Record,
                session_id: None,
            }));
        }
        let Some(session_id) = self.store.session_id_for_record(record)? else {
            return Ok(None);
        };
        Ok(self
            .get_by_session_id(&session_id)?
            .map(|signature| ResolvedSignature {
                signature,
                via: TargetKind::Session,
                session_id: Some(session_id),
            }))
    }

    pub fn signature_gate(&self, record: &RecordId) -> Result<SigningGate, SignatureError> {
        let signed = self.resolve_for_record(record)?.is_some();
        let sign_target = match self.store.session_id_for_record(record)? {
            Some(session_id) => SignatureTarget::Session(session_id),
            None => SignatureTarget::Record(record.clone()),
        };
        Ok(SigningGate {
            can_export: signed,
            can_sign: !signed,
            sign_target,
        })
    }

    fn load_session(&self, id: &SessionId) -> Result<SignatureSession, SignatureError> {
        self.store
            .read_session(id)?
            .ok_or_else(|| SignatureError::UnknownSession(id.clone()))
    }

    fn editable_session(&self, id: &SessionId) -> Result<SignatureSession, SignatureError> {
        let session = self.load_session(id)?;
        if session.status != SessionStatus::Draft {
            return Err(SignatureError::NotEditable(session.status));
        }
        Ok(session)
    }

    fn ensure_ungrouped(&self, record: &RecordId) -> Result<(), SignatureError> {
        match self.store.session_id_for_record(record)? {
            Some(session) => Err(SignatureError::RecordAlreadyGrouped {
                record: record.clone(),
                session,
            }),
            None => Ok(()),
        }
    }
}
