//! Address filtering.
//!
//! Decides which watched public keys an extrinsic pertains to: the
//! signer, any account id appearing in the call parameters (nested
//! batch calls included, since they live inside the argument tree), and
//! any account id appearing in the extrinsic's events. A single
//! extrinsic matching several watched accounts is emitted once, with
//! all of them in `matched`.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::classify::ClassifiedExtrinsic;
use crate::models::AccountId;
use crate::ports::{RawEvent, RawExtrinsic};

/// The set of watched public keys for one worker.
#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    watched: BTreeSet<AccountId>,
}

impl AddressFilter {
    pub fn new(watched: impl IntoIterator<Item = AccountId>) -> Self {
        Self {
            watched: watched.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, pubkey: AccountId) -> bool {
        self.watched.insert(pubkey)
    }

    pub fn remove(&mut self, pubkey: &AccountId) -> bool {
        self.watched.remove(pubkey)
    }

    pub fn contains(&self, pubkey: &AccountId) -> bool {
        self.watched.contains(pubkey)
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    /// Watched accounts referenced by the call itself: the signer or
    /// any account id in the argument tree.
    pub fn match_call(&self, extrinsic: &RawExtrinsic) -> BTreeSet<AccountId> {
        let mut matched = BTreeSet::new();
        if let Some(signer) = &extrinsic.signer {
            if self.watched.contains(signer) {
                matched.insert(signer.clone());
            }
        }
        self.scan_value(&extrinsic.args, &mut matched);
        matched
    }

    /// Watched accounts appearing in event parameters. Covers staking
    /// payouts where the signer is a third party.
    pub fn match_events<'a>(
        &self,
        events: impl IntoIterator<Item = &'a RawEvent>,
    ) -> BTreeSet<AccountId> {
        let mut matched = BTreeSet::new();
        for event in events {
            self.scan_value(&event.data, &mut matched);
        }
        matched
    }

    /// The full matched subset for one extrinsic, applying the
    /// retention policy: classified categories match on signer, params
    /// or events; unclassified extrinsics are retained only when a
    /// watched pubkey appears in their events.
    pub fn match_extrinsic(
        &self,
        extrinsic: &RawExtrinsic,
        classified: &ClassifiedExtrinsic,
        events: &[&RawEvent],
    ) -> BTreeSet<AccountId> {
        if classified.is_inherent() {
            return BTreeSet::new();
        }

        let event_matched = self.match_events(events.iter().copied());

        if classified.is_classified() {
            let mut matched = self.match_call(extrinsic);
            matched.extend(event_matched);
            matched
        } else if event_matched.is_empty() {
            BTreeSet::new()
        } else {
            let mut matched = event_matched;
            if let Some(signer) = &extrinsic.signer {
                if self.watched.contains(signer) {
                    matched.insert(signer.clone());
                }
            }
            matched
        }
    }

    /// Walk a decoded JSON tree collecting every watched account id.
    /// Account ids surface as 0x-prefixed 32-byte hex strings.
    fn scan_value(&self, value: &Value, matched: &mut BTreeSet<AccountId>) {
        match value {
            Value::String(s) => {
                if looks_like_account(s) {
                    if let Ok(account) = AccountId::from_hex(s) {
                        if self.watched.contains(&account) {
                            matched.insert(account);
                        }
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.scan_value(item, matched);
                }
            }
            Value::Object(fields) => {
                for item in fields.values() {
                    self.scan_value(item, matched);
                }
            }
            _ => {}
        }
    }
}

/// Cheap shape check before attempting a hex parse.
fn looks_like_account(s: &str) -> bool {
    let body = s.strip_prefix("0x").unwrap_or(s);
    body.len() == 64 && body.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_extrinsic;
    use serde_json::json;

    fn account_hex(byte: u8) -> String {
        format!("0x{}", hex::encode([byte; 32]))
    }

    fn extrinsic(pallet: &str, call: &str, signer: Option<u8>, args: Value) -> RawExtrinsic {
        RawExtrinsic {
            index: 1,
            pallet: pallet.into(),
            call: call.into(),
            signer: signer.map(|b| AccountId([b; 32])),
            args,
            success: true,
            tip: None,
        }
    }

    fn event(pallet: &str, name: &str, data: Value) -> RawEvent {
        RawEvent {
            index: 0,
            extrinsic_index: Some(1),
            pallet: pallet.into(),
            name: name.into(),
            data,
        }
    }

    #[test]
    fn matches_signer() {
        let filter = AddressFilter::new([AccountId([0xaa; 32])]);
        let xt = extrinsic(
            "Balances",
            "transfer",
            Some(0xaa),
            json!({"dest": account_hex(0x01), "value": "5"}),
        );
        let classified = classify_extrinsic(&xt, &[]);
        let matched = filter.match_extrinsic(&xt, &classified, &[]);
        assert_eq!(matched, BTreeSet::from([AccountId([0xaa; 32])]));
    }

    #[test]
    fn matches_transfer_destination() {
        let filter = AddressFilter::new([AccountId([0x20; 32])]);
        let xt = extrinsic(
            "Balances",
            "transfer_keep_alive",
            Some(0xaa),
            json!({"dest": {"Id": account_hex(0x20)}, "value": "5"}),
        );
        let classified = classify_extrinsic(&xt, &[]);
        let matched = filter.match_extrinsic(&xt, &classified, &[]);
        assert_eq!(matched, BTreeSet::from([AccountId([0x20; 32])]));
    }

    #[test]
    fn matches_nominate_target_inside_batch() {
        let filter = AddressFilter::new([AccountId([0x33; 32])]);
        let xt = extrinsic(
            "Utility",
            "batch",
            Some(0xaa),
            json!({"calls": [
                {"Staking": {"nominate": {"targets": [
                    {"Id": account_hex(0x32)},
                    {"Id": account_hex(0x33)}
                ]}}}
            ]}),
        );
        let classified = classify_extrinsic(&xt, &[]);
        let matched = filter.match_extrinsic(&xt, &classified, &[]);
        assert_eq!(matched, BTreeSet::from([AccountId([0x33; 32])]));
    }

    #[test]
    fn matches_event_participant_for_third_party_payout() {
        // Watched account is neither signer nor in params, only a
        // Reward beneficiary.
        let filter = AddressFilter::new([AccountId([0x20; 32])]);
        let xt = extrinsic(
            "Staking",
            "payout_stakers",
            Some(0xbb),
            json!({"validator_stash": account_hex(0x11), "era": "2048"}),
        );
        let reward = event("Staking", "Reward", json!([account_hex(0x20), "56754728805"]));
        let events = [&reward];
        let classified = classify_extrinsic(&xt, &events);
        let matched = filter.match_extrinsic(&xt, &classified, &events);
        assert_eq!(matched, BTreeSet::from([AccountId([0x20; 32])]));
    }

    #[test]
    fn multiple_watched_accounts_single_match_set() {
        let filter =
            AddressFilter::new([AccountId([0xaa; 32]), AccountId([0x20; 32])]);
        let xt = extrinsic(
            "Balances",
            "transfer",
            Some(0xaa),
            json!({"dest": account_hex(0x20), "value": "5"}),
        );
        let classified = classify_extrinsic(&xt, &[]);
        let matched = filter.match_extrinsic(&xt, &classified, &[]);
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn unclassified_requires_event_match() {
        let filter = AddressFilter::new([AccountId([0xaa; 32])]);

        // Signer is watched but the call is unclassified and produced
        // no event referencing a watched account.
        let xt = extrinsic("System", "remark", Some(0xaa), json!({"remark": "0x00"}));
        let classified = classify_extrinsic(&xt, &[]);
        assert!(filter.match_extrinsic(&xt, &classified, &[]).is_empty());

        // Same call with a watched account in an event is retained.
        let deposit = event("Balances", "Deposit", json!([account_hex(0xaa), "10"]));
        let events = [&deposit];
        let classified = classify_extrinsic(&xt, &events);
        let matched = filter.match_extrinsic(&xt, &classified, &events);
        assert_eq!(matched, BTreeSet::from([AccountId([0xaa; 32])]));
    }

    #[test]
    fn inherent_never_matches() {
        let filter = AddressFilter::new([AccountId([0xaa; 32])]);
        let mut xt = extrinsic("Timestamp", "set", None, json!({"now": "1613727474000"}));
        xt.index = 0;
        let classified = classify_extrinsic(&xt, &[]);
        assert!(filter.match_extrinsic(&xt, &classified, &[]).is_empty());
    }

    #[test]
    fn remove_stops_matching() {
        let mut filter = AddressFilter::new([AccountId([0xaa; 32])]);
        let xt = extrinsic(
            "Balances",
            "transfer",
            Some(0xaa),
            json!({"dest": account_hex(0x01), "value": "5"}),
        );
        let classified = classify_extrinsic(&xt, &[]);
        assert!(!filter.match_extrinsic(&xt, &classified, &[]).is_empty());

        filter.remove(&AccountId([0xaa; 32]));
        assert!(filter.match_extrinsic(&xt, &classified, &[]).is_empty());
    }
}
