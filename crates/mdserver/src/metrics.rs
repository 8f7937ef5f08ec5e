use std::sync::LazyLock;

use prometheus::{
    register_int_counter,
    IntCounter,
};

static PUTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "veilfs_mdserver_puts_total",
        "Revision puts received by the metadata server"
    )
    .unwrap()
});

static PUT_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "veilfs_mdserver_put_conflicts_total",
        "Puts rejected with a revision or chain conflict"
    )
    .unwrap()
});

static FOLDERS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "veilfs_mdserver_folders_created_total",
        "Folder ids minted for new handles"
    )
    .unwrap()
});

pub fn log_put() {
    PUTS_TOTAL.inc();
}

pub fn log_put_conflict() {
    PUT_CONFLICTS_TOTAL.inc();
}

pub fn log_folder_created() {
    FOLDERS_CREATED_TOTAL.inc();
}
