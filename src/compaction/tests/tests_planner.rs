use crate::compaction::{
    CompactionThresholds, LevelSummary, TableStub, plan_level0, plan_leveled, plan_size_tiered,
};

fn stub(file_id: u64, size: u64, min: &str, max: &str) -> TableStub {
    TableStub {
        file_id,
        size,
        min_key: min.as_bytes().to_vec(),
        max_key: max.as_bytes().to_vec(),
    }
}

fn level(tables: Vec<TableStub>) -> LevelSummary {
    let total_bytes = tables.iter().map(|t| t.size).sum();
    LevelSummary {
        tables,
        total_bytes,
    }
}

#[test]
fn level0_waits_for_file_limit() {
    let thresholds = CompactionThresholds::default();
    let l0 = level(vec![stub(1, 100, "a", "m"), stub(2, 100, "b", "z")]);
    let l1 = level(Vec::new());
    assert!(plan_level0(&l0, &l1, &thresholds).is_none());
}

#[test]
fn level0_takes_all_files_plus_overlaps() {
    let thresholds = CompactionThresholds::default();
    let l0 = level(vec![
        stub(4, 100, "d", "k"),
        stub(3, 100, "a", "f"),
        stub(2, 100, "m", "r"),
        stub(1, 100, "c", "h"),
    ]);
    let l1 = level(vec![
        stub(10, 500, "a", "e"),
        stub(11, 500, "f", "l"),
        stub(12, 500, "x", "z"), // outside [a, r]
    ]);

    let plan = plan_level0(&l0, &l1, &thresholds).unwrap();
    assert_eq!(plan.source_level, 0);
    assert_eq!(plan.target_level, 1);
    assert_eq!(plan.source_ids, vec![4, 3, 2, 1]);
    assert_eq!(plan.target_ids, vec![10, 11]);
}

#[test]
fn leveled_respects_byte_budget() {
    let thresholds = CompactionThresholds {
        base_level_bytes: 1000,
        level_size_multiplier: 10,
        ..CompactionThresholds::default()
    };
    // Level 1 budget is 1000; level 2's is 10 000.
    let under = level(vec![stub(1, 999, "a", "z")]);
    let next = level(Vec::new());
    assert!(plan_leveled(1, &under, &next, &thresholds).is_none());

    let over = level(vec![stub(1, 600, "a", "h"), stub(2, 600, "i", "z")]);
    let next = level(vec![stub(20, 100, "e", "j"), stub(21, 100, "p", "q")]);
    let plan = plan_leveled(1, &over, &next, &thresholds).unwrap();
    assert_eq!(plan.source_ids, vec![1]);
    // Victim [a, h] overlaps only [e, j].
    assert_eq!(plan.target_ids, vec![20]);
    assert_eq!(plan.target_level, 2);
}

#[test]
fn size_tiered_requires_similar_run() {
    let thresholds = CompactionThresholds {
        tier_min_tables: 3,
        tier_size_factor: 1.5,
        ..CompactionThresholds::default()
    };

    // Sizes too spread out: no run of 3 within 1.5×.
    let spread = level(vec![
        stub(1, 100, "a", "b"),
        stub(2, 400, "c", "d"),
        stub(3, 1600, "e", "f"),
        stub(4, 6400, "g", "h"),
    ]);
    assert!(plan_size_tiered(1, &spread, &thresholds).is_none());

    // A clean run of similar sizes merges.
    let similar = level(vec![
        stub(1, 100, "a", "b"),
        stub(2, 110, "c", "d"),
        stub(3, 120, "e", "f"),
        stub(4, 9000, "g", "h"),
    ]);
    let plan = plan_size_tiered(1, &similar, &thresholds).unwrap();
    assert_eq!(plan.source_ids.len(), 3);
    assert!(plan.source_ids.contains(&1));
    assert!(plan.source_ids.contains(&2));
    assert!(plan.source_ids.contains(&3));
    assert_eq!(plan.target_level, 2);
}

#[test]
fn budgets_scale_by_multiplier() {
    let thresholds = CompactionThresholds {
        base_level_bytes: 100,
        level_size_multiplier: 10,
        ..CompactionThresholds::default()
    };
    assert_eq!(thresholds.level_budget(1), 100);
    assert_eq!(thresholds.level_budget(2), 1000);
    assert_eq!(thresholds.level_budget(3), 10_000);
}
