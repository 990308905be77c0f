//! Persisted subscription record.

use crate::e2ap::SubscriptionDetails;
use crate::identifier::Identifier;
use crate::types::{Fingerprint, InstanceId, Timestamp};
use serde::{Deserialize, Serialize};

/// Current record layout. Records carrying any other version are not
/// interpreted.
pub const SCHEMA_VERSION: u32 = 1;

/// The durable form of one downstream subscription.
///
/// Every member endpoint maps to the single downstream `instance_id`. An
/// endpoint appears once per reference it holds, so the member count is the
/// group's reference count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub schema_version: u32,
    pub fingerprint: Fingerprint,
    pub instance_id: InstanceId,
    pub requestor_id: u32,
    pub target: Identifier,
    pub details: SubscriptionDetails,
    /// One entry per requester reference, sorted.
    pub members: Vec<String>,
    pub create_in_progress: bool,
    pub delete_in_progress: bool,
    pub created: Timestamp,
    pub updated: Timestamp,
    /// CRC-32 of the content fields.
    pub checksum: u32,
}

impl Subscription {
    pub fn new(
        fingerprint: Fingerprint,
        instance_id: InstanceId,
        requestor_id: u32,
        target: Identifier,
        details: SubscriptionDetails,
    ) -> Self {
        let now = Timestamp::now();
        let mut record = Self {
            schema_version: SCHEMA_VERSION,
            fingerprint,
            instance_id,
            requestor_id,
            target,
            details,
            members: Vec::new(),
            create_in_progress: false,
            delete_in_progress: false,
            created: now,
            updated: now,
            checksum: 0,
        };
        record.seal();
        record
    }

    /// Storage key of the record.
    pub fn key(&self) -> String {
        self.fingerprint.to_hex()
    }

    pub fn ref_count(&self) -> usize {
        self.members.len()
    }

    pub fn in_progress(&self) -> bool {
        self.create_in_progress || self.delete_in_progress
    }

    /// Recompute the checksum after a mutation.
    pub fn seal(&mut self) {
        self.checksum = self.content_checksum();
    }

    pub fn verify(&self) -> bool {
        self.checksum == self.content_checksum()
    }

    fn content_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.schema_version.to_le_bytes());
        hasher.update(&self.fingerprint.0);
        hasher.update(&self.instance_id.to_le_bytes());
        hasher.update(&self.requestor_id.to_le_bytes());
        update_field(&mut hasher, self.target.to_string().as_bytes());

        let details = &self.details;
        hasher.update(&details.ran_function_id.to_le_bytes());
        update_field(&mut hasher, &details.event_trigger);
        hasher.update(&(details.actions.len() as u32).to_le_bytes());
        for action in &details.actions {
            hasher.update(&[action.action_id, action.action_type as u8]);
            update_field(&mut hasher, &action.definition);
            match action.subsequent {
                Some(s) => hasher.update(&[1, s.kind as u8, s.time_to_wait]),
                None => hasher.update(&[0]),
            }
        }

        hasher.update(&(self.members.len() as u32).to_le_bytes());
        for member in &self.members {
            update_field(&mut hasher, member.as_bytes());
        }
        hasher.update(&[self.create_in_progress as u8, self.delete_in_progress as u8]);
        hasher.update(&self.created.0.to_le_bytes());
        hasher.update(&self.updated.0.to_le_bytes());
        hasher.finalize()
    }
}

fn update_field(hasher: &mut crc32fast::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u32).to_le_bytes());
    hasher.update(bytes);
}

/// Result of rehydrating the registry from storage.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Records loaded into memory.
    pub restored: Vec<Subscription>,
    /// Keys of records that were skipped.
    pub corrupted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::e2ap::ActionDefinition;

    fn record() -> Subscription {
        let details = SubscriptionDetails {
            ran_function_id: 2,
            event_trigger: vec![1, 2, 3],
            actions: vec![ActionDefinition::report(1, vec![9])],
        };
        Subscription::new(
            Fingerprint::from_bytes(b"rec"),
            7,
            123,
            "310-410/cell-7".parse().unwrap(),
            details,
        )
    }

    #[test]
    fn test_checksum_tracks_content() {
        let mut rec = record();
        assert!(rec.verify());

        rec.members.push("xapp-a:4560".into());
        assert!(!rec.verify());
        rec.seal();
        assert!(rec.verify());

        rec.details.event_trigger[0] = 0xff;
        assert!(!rec.verify());
    }

    #[test]
    fn test_json_document_carries_schema_version() {
        let rec = record();
        let doc: serde_json::Value = serde_json::to_value(&rec).unwrap();
        assert_eq!(doc["schema_version"], 1);
        assert_eq!(doc["target"], "310-410/cell-7");
        assert_eq!(doc["fingerprint"], rec.key());

        let back: Subscription = serde_json::from_value(doc).unwrap();
        assert_eq!(back, rec);
        assert!(back.verify());
    }
}
