#![no_main]

use libfuzzer_sys::fuzz_target;
use tg_chain::{ChainRecord, DecisionHashChain};
use tg_runtime::Sha256Digest;

fuzz_target!(|data: &[u8]| {
    let Ok(records) = serde_json::from_slice::<Vec<ChainRecord>>(data) else {
        return;
    };
    let count = records.len();
    let chain = DecisionHashChain::from_records(records, Box::new(Sha256Digest));
    let report = chain.verify_report();

    assert!(report.records_checked <= count);
    match report.first_break.as_ref() {
        Some(broken) => {
            let last_checked = &chain.records()[report.records_checked - 1];
            assert_eq!(last_checked.sequence_id, broken.sequence_id);
        }
        None => assert_eq!(report.records_checked, count),
    }
    assert_eq!(chain.verify_chain(), report.is_intact());
});
