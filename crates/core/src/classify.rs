//! Extrinsic classification.
//!
//! Normalizes a decoded extrinsic plus its events into a tagged call
//! tree the address filter can work with. Batch calls are classified
//! recursively with a depth cap; beyond the cap a call degrades to
//! `Other` rather than recursing further.

use serde_json::Value;
use tracing::debug;

use crate::models::AccountId;
use crate::ports::{RawEvent, RawExtrinsic};

/// Maximum nesting depth for `Utility.batch` classification.
pub const MAX_BATCH_DEPTH: usize = 8;

/// Balances calls that move funds to a destination.
const TRANSFER_FUNCTIONS: &[&str] = &["transfer", "transfer_keep_alive", "transfer_all"];

/// Staking calls of interest to portfolio tracking.
const STAKING_FUNCTIONS: &[&str] = &[
    "bond",
    "bond_extra",
    "unbond",
    "nominate",
    "chill",
    "payout_stakers",
    "withdraw_unbonded",
    "set_controller",
    "set_payee",
];

// =============================================================================
// Classified call tree
// =============================================================================

/// One call, either the extrinsic's top-level call or a call nested
/// inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedCall {
    pub module: String,
    pub function: String,
    pub kind: CallKind,
}

/// Category of a call after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum CallKind {
    /// Block-author inherent (`Timestamp.set` at index 0). Block-level
    /// side effect only, never persisted.
    Inherent,
    /// `Balances.transfer*`.
    BalanceTransfer {
        dest: Option<AccountId>,
        value: Option<u128>,
    },
    /// A staking call, with the account-bearing parameters pulled out
    /// for the filter.
    StakingCall {
        controller: Option<AccountId>,
        payee: Option<AccountId>,
        targets: Vec<AccountId>,
        validator_stash: Option<AccountId>,
        era: Option<u32>,
    },
    /// `Utility.batch` / `batch_all`, with each inner call classified
    /// as if standalone.
    Batch(Vec<ClassifiedCall>),
    /// Anything else. Retained only when a watched pubkey appears in
    /// the extrinsic's events.
    Other,
}

/// A fully classified extrinsic.
#[derive(Debug, Clone)]
pub struct ClassifiedExtrinsic {
    pub call: ClassifiedCall,
    /// Computed fee in planck units; `None` when the events carry too
    /// little information to compute one.
    pub fee: Option<u128>,
    pub tip: u128,
}

impl ClassifiedExtrinsic {
    /// Whether this is a block-author inherent.
    pub fn is_inherent(&self) -> bool {
        matches!(self.call.kind, CallKind::Inherent)
    }

    /// Whether any call in the tree is a classified category (transfer,
    /// staking, or a batch containing one).
    pub fn is_classified(&self) -> bool {
        fn any_classified(call: &ClassifiedCall) -> bool {
            match &call.kind {
                CallKind::BalanceTransfer { .. } | CallKind::StakingCall { .. } => true,
                CallKind::Batch(inner) => inner.iter().any(any_classified),
                CallKind::Inherent | CallKind::Other => false,
            }
        }
        any_classified(&self.call)
    }

    /// The innermost `payout_stakers` parameters, when present anywhere
    /// in the call tree. Used to resolve era and validator for staking
    /// events emitted by the extrinsic.
    pub fn payout_context(&self) -> Option<(Option<AccountId>, Option<u32>)> {
        fn find(call: &ClassifiedCall) -> Option<(Option<AccountId>, Option<u32>)> {
            match &call.kind {
                CallKind::StakingCall {
                    validator_stash,
                    era,
                    ..
                } if call.function == "payout_stakers" => {
                    Some((validator_stash.clone(), *era))
                }
                CallKind::Batch(inner) => inner.iter().find_map(find),
                _ => None,
            }
        }
        find(&self.call)
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Classify an extrinsic together with the events it produced.
pub fn classify_extrinsic(extrinsic: &RawExtrinsic, events: &[&RawEvent]) -> ClassifiedExtrinsic {
    let call = classify_call(&extrinsic.pallet, &extrinsic.call, &extrinsic.args, 0);

    // Timestamp inherent: unsigned, index 0, Timestamp pallet.
    let call = if extrinsic.signer.is_none()
        && extrinsic.index == 0
        && extrinsic.pallet == "Timestamp"
    {
        ClassifiedCall {
            kind: CallKind::Inherent,
            ..call
        }
    } else {
        call
    };

    let tip = extrinsic.tip.unwrap_or(0);
    let fee = compute_fee(extrinsic.signer.as_ref(), tip, events);

    ClassifiedExtrinsic { call, fee, tip }
}

fn classify_call(module: &str, function: &str, args: &Value, depth: usize) -> ClassifiedCall {
    let kind = match (module, function) {
        ("Balances", f) if TRANSFER_FUNCTIONS.contains(&f) => CallKind::BalanceTransfer {
            dest: pick(args, &["dest", "who"], 0).and_then(account_from),
            value: pick(args, &["value", "amount"], 1).and_then(amount_from),
        },
        ("Staking", f) if STAKING_FUNCTIONS.contains(&f) => CallKind::StakingCall {
            controller: named(args, &["controller"]).and_then(account_from),
            payee: named(args, &["payee"]).and_then(payee_account),
            targets: args
                .get("targets")
                .and_then(Value::as_array)
                .map(|targets| targets.iter().filter_map(account_from).collect())
                .unwrap_or_default(),
            validator_stash: named(args, &["validator_stash"]).and_then(account_from),
            era: named(args, &["era"])
                .and_then(amount_from)
                .and_then(|e| u32::try_from(e).ok()),
        },
        ("Utility", "batch" | "batch_all" | "force_batch") => {
            if depth >= MAX_BATCH_DEPTH {
                debug!(module, function, depth, "batch nesting exceeds cap");
                CallKind::Other
            } else {
                let inner = args
                    .get("calls")
                    .and_then(Value::as_array)
                    .map(|calls| {
                        calls
                            .iter()
                            .filter_map(parse_runtime_call)
                            .map(|(m, f, a)| classify_call(&m, &f, a, depth + 1))
                            .collect()
                    })
                    .unwrap_or_default();
                CallKind::Batch(inner)
            }
        }
        _ => CallKind::Other,
    };

    ClassifiedCall {
        module: module.to_string(),
        function: function.to_string(),
        kind,
    }
}

/// Split one entry of a batch's `calls` array into (pallet, call, args).
///
/// The decoded runtime call arrives as nested single-key objects:
/// `{"Balances": {"transfer_keep_alive": {...args...}}}`.
fn parse_runtime_call(value: &Value) -> Option<(String, String, &Value)> {
    let outer = value.as_object()?;
    if outer.len() != 1 {
        return None;
    }
    let (module, inner) = outer.iter().next()?;
    let inner_obj = inner.as_object()?;
    if inner_obj.len() != 1 {
        return None;
    }
    let (function, args) = inner_obj.iter().next()?;
    Some((module.clone(), function.clone(), args))
}

// =============================================================================
// Fee computation
// =============================================================================

/// Fee paid by a signed extrinsic: the sum of `Balances.Deposit` and
/// `Treasury.Deposit` amounts to accounts other than the signer, plus
/// the tip. `None` when no deposit event is available (unknown), never
/// zero by assumption.
fn compute_fee(signer: Option<&AccountId>, tip: u128, events: &[&RawEvent]) -> Option<u128> {
    signer?;

    let mut total: u128 = 0;
    let mut seen_deposit = false;

    for event in events {
        let is_deposit = matches!(
            (event.pallet.as_str(), event.name.as_str()),
            ("Balances", "Deposit") | ("Treasury", "Deposit")
        );
        if !is_deposit {
            continue;
        }

        // Balances.Deposit carries the beneficiary; skip self-deposits.
        if let Some(who) = pick(&event.data, &["who"], 0).and_then(account_from) {
            if Some(&who) == signer {
                continue;
            }
        }

        if let Some(amount) = pick(&event.data, &["amount", "value"], 1)
            .or_else(|| event.data.get(0))
            .and_then(amount_from)
        {
            total = total.saturating_add(amount);
            seen_deposit = true;
        }
    }

    seen_deposit.then(|| total.saturating_add(tip))
}

// =============================================================================
// Staking event extraction
// =============================================================================

/// One staking event with its beneficiary, before address filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct StakingEvent {
    pub event_index: u32,
    pub event_id: String,
    pub beneficiary: AccountId,
    pub amount: u128,
}

/// Staking events of interest for portfolio bookkeeping.
const STAKING_EVENT_IDS: &[&str] = &[
    "Reward",
    "Rewarded",
    "Bonded",
    "Unbonded",
    "Nominated",
    "Slashed",
    "Withdrawn",
];

/// Pull the staking events out of one extrinsic's event list.
///
/// The beneficiary is the first account parameter, the amount the first
/// numeric one; events without either are skipped.
pub fn extract_staking_events(events: &[&RawEvent]) -> Vec<StakingEvent> {
    events
        .iter()
        .filter(|e| e.pallet == "Staking" && STAKING_EVENT_IDS.contains(&e.name.as_str()))
        .filter_map(|e| {
            let beneficiary = pick(&e.data, &["stash", "who", "nominator", "staker"], 0)
                .and_then(account_from)?;
            let amount = pick(&e.data, &["amount", "value"], 1)
                .and_then(amount_from)
                .unwrap_or(0);
            Some(StakingEvent {
                event_index: e.index,
                event_id: e.name.clone(),
                beneficiary,
                amount,
            })
        })
        .collect()
}

// =============================================================================
// Decoded-argument access
// =============================================================================
//
// Runtime metadata versions disagree on argument names, and some
// decode into bare tuples with no names at all. Lookups therefore try
// the known aliases before falling back to the tuple position, and the
// parsers tolerate every shape the dynamic decoder produces.

/// Argument by alias, then by tuple position.
fn pick<'a>(data: &'a Value, aliases: &[&str], position: usize) -> Option<&'a Value> {
    for alias in aliases {
        if let Some(found) = data.get(alias) {
            return Some(found);
        }
    }
    data.get(position)
}

/// Argument by alias only, for calls that never decode positionally.
fn named<'a>(data: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|alias| data.get(alias))
}

/// Account id out of a decoded value. Handles the hex form directly,
/// peels single-key enum wrappers (`MultiAddress::Id` and friends) and
/// single-element newtype arrays, and accepts a raw 32-byte array.
fn account_from(value: &Value) -> Option<AccountId> {
    match value {
        Value::String(s) => AccountId::from_hex(s).ok(),
        Value::Object(wrapper) if wrapper.len() == 1 => {
            account_from(wrapper.values().next()?)
        }
        Value::Array(items) => match items.as_slice() {
            [single] => account_from(single),
            bytes if bytes.len() == 32 => {
                let mut key = [0u8; 32];
                for (slot, item) in key.iter_mut().zip(bytes) {
                    *slot = u8::try_from(item.as_u64()?).ok()?;
                }
                Some(AccountId(key))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Balance out of a decoded value. Wide balances arrive as decimal
/// strings; small ones may still be plain numbers.
fn amount_from(value: &Value) -> Option<u128> {
    match value.as_str() {
        Some(s) => s.parse().ok(),
        None => value.as_u64().map(u128::from),
    }
}

/// A `RewardDestination` carries an account only in its `Account`
/// variant; `Staked`/`Stash`/`Controller` resolve to the signer's own
/// accounts and need no extra match.
fn payee_account(value: &Value) -> Option<AccountId> {
    value.as_object()?.get("Account").and_then(account_from)
}

// =============================================================================
// Tests
// =============================================================================
