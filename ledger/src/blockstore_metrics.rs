//! Counters tracking one batch of shred insertions.

/// Metrics for the shred inserter, passed `&mut` into
/// [`crate::blockstore::Blockstore::insert_shreds_handle_duplicate`] and
/// accumulated across calls by the owning service.
#[derive(Default)]
pub struct BlockstoreInsertionMetrics {
    pub insert_lock_elapsed_us: u64,
    pub insert_shreds_elapsed_us: u64,
    pub shred_recovery_elapsed_us: u64,
    pub chaining_elapsed_us: u64,
    pub commit_working_sets_elapsed_us: u64,
    pub write_batch_elapsed_us: u64,
    pub total_elapsed_us: u64,
    pub index_meta_time_us: u64,
    pub num_shreds: usize,
    pub num_inserted: u64,
    pub num_repair: u64,
    pub num_recovered: usize,
    pub num_recovered_inserted: usize,
    pub num_recovered_failed_sig: usize,
    pub num_recovered_failed_invalid: usize,
    pub num_recovered_exists: usize,
    pub num_repaired_data_shreds_exists: usize,
    pub num_turbine_data_shreds_exists: usize,
    pub num_data_shreds_invalid: usize,
    pub num_code_shreds_exists: usize,
    pub num_code_shreds_invalid: usize,
    pub num_code_shreds_invalid_erasure_config: usize,
    pub num_code_shreds_inserted: usize,
}

impl BlockstoreInsertionMetrics {
    pub fn report_metrics(&self) {
        info!(
            target: "metrics",
            "shred_inserter_num_shreds={} \
             shred_inserter_num_inserted={} \
             shred_inserter_num_repair={} \
             shred_inserter_num_recovered={} \
             shred_inserter_num_recovered_inserted={} \
             shred_inserter_num_recovered_failed_sig={} \
             shred_inserter_num_recovered_failed_invalid={} \
             shred_inserter_num_recovered_exists={} \
             shred_inserter_num_repaired_data_shreds_exists={} \
             shred_inserter_num_turbine_data_shreds_exists={} \
             shred_inserter_num_data_shreds_invalid={} \
             shred_inserter_num_code_shreds_exists={} \
             shred_inserter_num_code_shreds_invalid={} \
             shred_inserter_num_code_shreds_invalid_erasure_config={} \
             shred_inserter_num_code_shreds_inserted={} \
             insert_lock_elapsed_us={} \
             insert_shreds_elapsed_us={} \
             shred_recovery_elapsed_us={} \
             chaining_elapsed_us={} \
             commit_working_sets_elapsed_us={} \
             write_batch_elapsed_us={} \
             total_elapsed_us={} \
             index_meta_time_us={}",
            self.num_shreds,
            self.num_inserted,
            self.num_repair,
            self.num_recovered,
            self.num_recovered_inserted,
            self.num_recovered_failed_sig,
            self.num_recovered_failed_invalid,
            self.num_recovered_exists,
            self.num_repaired_data_shreds_exists,
            self.num_turbine_data_shreds_exists,
            self.num_data_shreds_invalid,
            self.num_code_shreds_exists,
            self.num_code_shreds_invalid,
            self.num_code_shreds_invalid_erasure_config,
            self.num_code_shreds_inserted,
            self.insert_lock_elapsed_us,
            self.insert_shreds_elapsed_us,
            self.shred_recovery_elapsed_us,
            self.chaining_elapsed_us,
            self.commit_working_sets_elapsed_us,
            self.write_batch_elapsed_us,
            self.total_elapsed_us,
            self.index_meta_time_us,
        );
    }
}
