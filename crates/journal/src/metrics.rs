use std::sync::LazyLock;

use prometheus::{
    register_int_counter,
    IntCounter,
};

static APPENDS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "veilfs_journal_appends_total",
        "Revisions appended to folder journals"
    )
    .unwrap()
});

static FLUSHES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "veilfs_journal_flushes_total",
        "Revisions successfully flushed to the metadata server"
    )
    .unwrap()
});

static FLUSH_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "veilfs_journal_flush_conflicts_total",
        "Revision conflicts reported by the metadata server during flush"
    )
    .unwrap()
});

static BRANCH_CONVERSIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "veilfs_journal_branch_conversions_total",
        "Journals converted onto an unmerged branch"
    )
    .unwrap()
});

pub fn log_append() {
    APPENDS_TOTAL.inc();
}

pub fn log_flush() {
    FLUSHES_TOTAL.inc();
}

pub fn log_flush_conflict() {
    FLUSH_CONFLICTS_TOTAL.inc();
}

pub fn log_branch_conversion() {
    BRANCH_CONVERSIONS_TOTAL.inc();
}
