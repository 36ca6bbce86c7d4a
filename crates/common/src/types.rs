//! Call record data model.
//!
//! A [`CallRecord`] is the shared, persisted representation of one call. Both
//! participants (and any observer) read it; each field has one logical writer:
//! the offer belongs to the initiator, the answer to the responder, and the
//! status to whichever side transitions first.
//!
//! The stored form is a flat string map keyed by the camelCase wire names in
//! [`CallRecord::FIELD_NAMES`]; [`CallRecord::to_fields`] and
//! [`CallRecord::from_fields`] convert between the two.

use crate::error::RecordError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CallId {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| RecordError::InvalidValue {
                field: "callId",
                value: s.to_string(),
            })
    }
}

/// Identifier of a user taking part in calls.
///
/// User IDs are issued by the surrounding application and are opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of media a call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            other => Err(RecordError::InvalidValue {
                field: "mediaKind",
                value: other.to_string(),
            }),
        }
    }
}

/// Status of a call as stored in its record.
///
/// Observers must tolerate out-of-order writes; the store applies
/// last-write-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Connected,
    Declined,
    Ended,
}

impl CallStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Connected => "connected",
            CallStatus::Declined => "declined",
            CallStatus::Ended => "ended",
        }
    }

    /// Whether no further transition is expected from this status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Declined | CallStatus::Ended)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(CallStatus::Ringing),
            "accepted" => Ok(CallStatus::Accepted),
            "connected" => Ok(CallStatus::Connected),
            "declined" => Ok(CallStatus::Declined),
            "ended" => Ok(CallStatus::Ended),
            other => Err(RecordError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Opaque negotiation blob produced by the peer negotiation library.
///
/// Stored and forwarded verbatim. `Debug` only prints the length so payloads
/// never end up in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(String);

impl SignalPayload {
    #[must_use]
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for SignalPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalPayload({} bytes)", self.0.len())
    }
}

/// A subscribable field of a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordField {
    #[serde(rename = "offerPayload")]
    Offer,
    #[serde(rename = "answerPayload")]
    Answer,
    #[serde(rename = "status")]
    Status,
}

impl RecordField {
    /// Wire name of the field in the stored record.
    #[must_use]
    pub const fn wire_name(&self) -> &'static str {
        match self {
            RecordField::Offer => "offerPayload",
            RecordField::Answer => "answerPayload",
            RecordField::Status => "status",
        }
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Persisted record of one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    pub offer_payload: Option<SignalPayload>,
    pub answer_payload: Option<SignalPayload>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    /// Wire names of every stored field.
    pub const FIELD_NAMES: [&'static str; 9] = [
        "callId",
        "callerId",
        "receiverId",
        "mediaKind",
        "status",
        "offerPayload",
        "answerPayload",
        "startedAt",
        "endedAt",
    ];

    /// Create the record for a freshly initiated call (status `ringing`).
    #[must_use]
    pub fn ringing(
        call_id: CallId,
        caller_id: UserId,
        receiver_id: UserId,
        media_kind: MediaKind,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id,
            caller_id,
            receiver_id,
            media_kind,
            status: CallStatus::Ringing,
            offer_payload: None,
            answer_payload: None,
            started_at,
            ended_at: None,
        }
    }

    /// Whether this record is an incoming call the given user should be prompted for.
    #[must_use]
    pub fn is_ringing_for(&self, user: &UserId) -> bool {
        self.status == CallStatus::Ringing && &self.receiver_id == user
    }

    /// Whether the user is one of the two parties of this call.
    #[must_use]
    pub fn involves(&self, user: &UserId) -> bool {
        &self.caller_id == user || &self.receiver_id == user
    }

    /// Current value of a subscribable field, rendered as its stored string.
    #[must_use]
    pub fn field_value(&self, field: RecordField) -> Option<String> {
        match field {
            RecordField::Offer => self.offer_payload.as_ref().map(|p| p.as_str().to_string()),
            RecordField::Answer => self.answer_payload.as_ref().map(|p| p.as_str().to_string()),
            RecordField::Status => Some(self.status.as_str().to_string()),
        }
    }

    /// Flatten the record into (wire name, value) pairs. Absent optional
    /// fields are omitted.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("callId", self.call_id.to_string()),
            ("callerId", self.caller_id.to_string()),
            ("receiverId", self.receiver_id.to_string()),
            ("mediaKind", self.media_kind.as_str().to_string()),
            ("status", self.status.as_str().to_string()),
            ("startedAt", format_timestamp(&self.started_at)),
        ];
        if let Some(offer) = &self.offer_payload {
            fields.push(("offerPayload", offer.as_str().to_string()));
        }
        if let Some(answer) = &self.answer_payload {
            fields.push(("answerPayload", answer.as_str().to_string()));
        }
        if let Some(ended_at) = &self.ended_at {
            fields.push(("endedAt", format_timestamp(ended_at)));
        }
        fields
    }

    /// Rebuild a record from its flattened stored form.
    ///
    /// # Errors
    ///
    /// Returns `RecordError` if a required field is missing or a value cannot
    /// be parsed.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, RecordError> {
        let required = |name: &'static str| {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or(RecordError::MissingField(name))
        };

        Ok(Self {
            call_id: required("callId")?.parse()?,
            caller_id: UserId::new(required("callerId")?),
            receiver_id: UserId::new(required("receiverId")?),
            media_kind: required("mediaKind")?.parse()?,
            status: required("status")?.parse()?,
            offer_payload: fields.get("offerPayload").cloned().map(SignalPayload::new),
            answer_payload: fields.get("answerPayload").cloned().map(SignalPayload::new),
            started_at: parse_timestamp("startedAt", required("startedAt")?)?,
            ended_at: fields
                .get("endedAt")
                .map(|v| parse_timestamp("endedAt", v))
                .transpose()?,
        })
    }
}

/// Render a timestamp the way records store it (RFC 3339, millisecond precision).
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, RecordError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| RecordError::InvalidValue {
            field,
            value: value.to_string(),
        })
}
