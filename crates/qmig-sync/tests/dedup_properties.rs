//! Property tests for answer de-duplication.

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use qmig_core::{AnswerCandidate, DedupKey, TypedValue};
use qmig_sync::{deduplicate, RevisionIndex};
use uuid::Uuid;

const SHEETS: usize = 2;
const QUESTIONS: usize = 3;
const LATEST_REVISION: usize = 2;

fn sheet_ids() -> [Uuid; SHEETS] {
    [Uuid::from_u128(1), Uuid::from_u128(2)]
}

fn question_ids() -> [Uuid; QUESTIONS] {
    [Uuid::from_u128(11), Uuid::from_u128(12), Uuid::from_u128(13)]
}

fn column_ids() -> [Uuid; 2] {
    [Uuid::from_u128(21), Uuid::from_u128(22)]
}

fn revision(sheet: usize, rev: usize) -> String {
    format!("S{sheet}-R{rev}")
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("base time")
}

fn revisions() -> RevisionIndex {
    let mut index = RevisionIndex::default();
    for (i, id) in sheet_ids().iter().enumerate() {
        index.insert(*id, revision(i, LATEST_REVISION));
    }
    index
}

/// (sheet, question, tabular, row, column, revision, day)
type RawCandidate = (usize, usize, bool, usize, usize, usize, i64);

fn raw_strategy() -> impl Strategy<Value = RawCandidate> {
    (
        0..SHEETS,
        0..QUESTIONS,
        any::<bool>(),
        0usize..3,
        0usize..2,
        0..=LATEST_REVISION,
        0i64..20,
    )
}

fn candidates_strategy() -> impl Strategy<Value = Vec<AnswerCandidate>> {
    prop::collection::vec(raw_strategy(), 0..60).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (sheet, question, tabular, row, column, rev, day))| AnswerCandidate {
                external_id: format!("a{i:03}"),
                sheet_id: sheet_ids()[sheet],
                source_revision_id: revision(sheet, rev),
                question_id: question_ids()[question],
                row_key: tabular.then(|| format!("row-{row}")),
                column_id: tabular.then(|| column_ids()[column]),
                modified_at: base_time() + Duration::days(day),
                value: Some(TypedValue::Text(format!("v{i}"))),
                choice_ids: vec![],
                author_id: None,
                raw_text: Some(format!("v{i}")),
            })
            .collect()
    })
}

fn eligible(candidate: &AnswerCandidate, index: &RevisionIndex) -> bool {
    !candidate.is_tabular()
        || index.latest_external_id_for(candidate.sheet_id)
            == Some(candidate.source_revision_id.as_str())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn retained_candidate_is_the_newest_of_its_key(candidates in candidates_strategy()) {
        let index = revisions();
        let (winners, _) = deduplicate(candidates.clone(), &index);
        let winners: HashMap<DedupKey, AnswerCandidate> =
            winners.into_iter().map(|w| (w.dedup_key(), w)).collect();

        for candidate in candidates.iter().filter(|c| eligible(c, &index)) {
            let winner = winners.get(&candidate.dedup_key());
            prop_assert!(winner.is_some());
            prop_assert!(winner.map(|w| w.modified_at >= candidate.modified_at).unwrap_or(false));
        }
    }

    #[test]
    fn no_stale_tabular_candidate_survives(candidates in candidates_strategy()) {
        let index = revisions();
        let (winners, stats) = deduplicate(candidates.clone(), &index);
        for winner in &winners {
            prop_assert!(eligible(winner, &index));
        }
        let stale = candidates.iter().filter(|c| !eligible(c, &index)).count();
        prop_assert_eq!(stats.stale_revision, stale);
    }

    #[test]
    fn arrival_order_does_not_matter(
        candidates in candidates_strategy().prop_flat_map(|c| {
            let shuffled = Just(c.clone()).prop_shuffle();
            (Just(c), shuffled)
        })
    ) {
        let (original, shuffled) = candidates;
        let index = revisions();
        let (a, _) = deduplicate(original, &index);
        let (b, _) = deduplicate(shuffled, &index);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn one_winner_per_key(candidates in candidates_strategy()) {
        let index = revisions();
        let (winners, stats) = deduplicate(candidates.clone(), &index);
        let mut keys: Vec<DedupKey> = winners.iter().map(AnswerCandidate::dedup_key).collect();
        let before = keys.len();
        keys.dedup();
        prop_assert_eq!(keys.len(), before);
        prop_assert_eq!(winners.len() + stats.superseded + stats.stale_revision, candidates.len());
    }
}
