//! Sample inventory loaded before the relay starts.

use tracing::{debug, info};

use crate::core::record::Record;
use crate::store::error;
use crate::store::RecordStore;

/// `(identifier, name, size, color, quantity)` rows shipped with the relay.
pub const SAMPLE_RECORDS: [(&str, &str, &str, &str, i64); 4] = [
    ("MERT2025EFGH5678", "T-Shirt", "M", "Yeşil", 5),
    ("MERT2025ABCD1234", "Kot Pantolon", "L", "Koyu Mavi", 3),
    ("MERT2025ETEK0001", "Etek", "S", "Siyah", 10),
    ("MERT2025GMLK9999", "Gömlek", "XL", "Beyaz", 24),
];

pub fn sample_records() -> Vec<Record> {
    SAMPLE_RECORDS
        .iter()
        .map(|(id, name, size, color, qty)| {
            Record::new(*id, Some(*name), Some(*size), Some(*color), *qty)
        })
        .collect()
}

/// Insert every sample whose identifier is not stored yet.
///
/// Returns the number of rows inserted; a second run inserts nothing.
pub fn seed_samples(store: &dyn RecordStore) -> error::Result<usize> {
    let mut inserted = 0;
    for record in sample_records() {
        if store.lookup(&record.identifier)?.is_found() {
            debug!(identifier = %record.identifier, "sample already present");
            continue;
        }
        let row_id = store.insert(&record)?;
        debug!(identifier = %record.identifier, row_id, "sample inserted");
        inserted += 1;
    }
    info!(inserted, "sample records seeded");
    Ok(inserted)
}
