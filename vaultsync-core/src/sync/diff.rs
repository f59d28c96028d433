//! Diffing of a listed page against the cache.

use crate::models::{ItemId, ItemRevision, SymmetricallyEncryptedItem};
use crate::sync::conflict::{ConflictResolver, Resolution};
use std::collections::{BTreeMap, HashMap};

/// What to do with one listed page.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PagePlan {
    /// New or newer revisions to cache.
    pub accepted: Vec<ItemRevision>,
    /// Items left alone because a local change awaits push.
    pub held: Vec<ItemId>,
    pub unchanged: usize,
}

pub fn index_records(
    records: Vec<SymmetricallyEncryptedItem>,
) -> HashMap<ItemId, SymmetricallyEncryptedItem> {
    records
        .into_iter()
        .map(|record| (record.item_id.clone(), record))
        .collect()
}

pub fn plan_page(
    page: Vec<ItemRevision>,
    local: &HashMap<ItemId, SymmetricallyEncryptedItem>,
) -> PagePlan {
    let mut plan = PagePlan::default();
    for remote in page {
        match local.get(&remote.item_id) {
            None if ConflictResolver::accept_new(&remote) => plan.accepted.push(remote),
            None => plan.unchanged += 1,
            Some(cached) => match ConflictResolver::resolve(cached.revision, cached.pending, &remote) {
                Resolution::AcceptRemote => plan.accepted.push(remote),
                Resolution::KeepLocal if cached.pending => plan.held.push(remote.item_id),
                Resolution::KeepLocal => plan.unchanged += 1,
            },
        }
    }
    plan
}

/// Cached items the completed listing no longer contains. Items with a
/// local change awaiting push are kept.
pub fn plan_removals(
    seen: &BTreeMap<ItemId, i64>,
    local: &HashMap<ItemId, SymmetricallyEncryptedItem>,
) -> Vec<ItemId> {
    let mut removals: Vec<ItemId> = local
        .values()
        .filter(|record| !record.pending && !seen.contains_key(&record.item_id))
        .map(|record| record.item_id.clone())
        .collect();
    removals.sort();
    removals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemState, ShareId};

    fn remote(id: &str, revision: i64) -> ItemRevision {
        ItemRevision {
            item_id: ItemId::from(id),
            revision,
            content_format_version: 1,
            key_rotation: 1,
            content: String::new(),
            state: ItemState::Active,
            create_time: 1,
            modify_time: 1,
            last_use_time: None,
            revision_time: 1,
        }
    }

    fn record(id: &str, revision: i64, pending: bool) -> SymmetricallyEncryptedItem {
        SymmetricallyEncryptedItem {
            share_id: ShareId::from("share-1"),
            item_id: ItemId::from(id),
            revision,
            key_rotation: 1,
            state: ItemState::Active,
            modify_time: 1,
            last_use_time: None,
            pending,
            encrypted_revision: String::new(),
        }
    }

    #[test]
    fn page_plan_sorts_items() {
        let local = index_records(vec![
            record("same", 2, false),
            record("older", 1, false),
            record("edited", 1, true),
        ]);
        let plan = plan_page(
            vec![
                remote("new", 1),
                remote("same", 2),
                remote("older", 3),
                remote("edited", 4),
            ],
            &local,
        );

        let accepted: Vec<&str> = plan.accepted.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(accepted, vec!["new", "older"]);
        assert_eq!(plan.held, vec![ItemId::from("edited")]);
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn removals_skip_seen_and_pending() {
        let local = index_records(vec![
            record("kept", 1, false),
            record("gone", 1, false),
            record("local-only", 0, true),
        ]);
        let mut seen = BTreeMap::new();
        seen.insert(ItemId::from("kept"), 1);

        assert_eq!(plan_removals(&seen, &local), vec![ItemId::from("gone")]);
    }

    #[test]
    fn empty_listing_removes_everything_synced() {
        let local = index_records(vec![record("a", 1, false), record("b", 2, false)]);
        let removals = plan_removals(&BTreeMap::new(), &local);
        assert_eq!(removals, vec![ItemId::from("a"), ItemId::from("b")]);
    }
}
