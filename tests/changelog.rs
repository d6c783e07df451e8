use fluxmesh::changelog::{ChangeLog, ChangeLogEntry};
use fluxmesh::operator::{OperatorKind, OperatorNode, SinkDescriptor};
use fluxmesh::utils::now_micros;

fn fresh_id() -> fluxmesh::OperatorId {
    // Ids come from the process-wide sequence; any operator gives us one.
    OperatorNode::new(OperatorKind::Sink {
        descriptor: SinkDescriptor::Null,
    })
    .id
}

#[test]
fn timestamps_are_strictly_monotonic() {
    let mut log = ChangeLog::new();
    let mut last = 0;
    for _ in 0..100 {
        let ts = log.append(ChangeLogEntry::new([fresh_id()], [fresh_id()]));
        assert!(ts > last, "timestamp {ts} not above {last}");
        last = ts;
    }
    assert_eq!(log.last_timestamp(), last);
}

#[test]
fn entries_are_filtered_by_watermark() {
    let mut log = ChangeLog::new();
    let first = log.append(ChangeLogEntry::new([fresh_id()], [fresh_id()]));
    let second = log.append(ChangeLogEntry::new([fresh_id()], [fresh_id()]));

    assert_eq!(log.entries_up_to(first).len(), 1);
    assert_eq!(log.entries_up_to(second).len(), 2);
    assert!(log.entries_up_to(first - 1).is_empty());

    let all = log.entries_up_to(now_micros().max(second));
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0), "entries out of order");
}

#[test]
fn overlapping_entries_are_absorbed() {
    let shared_upstream = fresh_id();
    let mut log = ChangeLog::new();
    log.append(ChangeLogEntry::new([shared_upstream], [fresh_id()]));
    log.append(ChangeLogEntry::new([fresh_id()], [fresh_id()]));
    // Overlaps the first entry via the shared upstream operator.
    let sink = fresh_id();
    log.append(ChangeLogEntry::new([shared_upstream], [sink]));

    assert_eq!(log.len(), 2);
    let entries = log.entries_up_to(log.last_timestamp());
    let merged = entries.last().expect("absorbed entry at the tail").1;
    assert!(merged.upstream.contains(&shared_upstream));
    assert_eq!(merged.downstream.len(), 2, "both sinks in the union entry");

    // Every operator appears in exactly one live entry.
    let mut seen = std::collections::BTreeSet::new();
    for (_, entry) in &entries {
        for op in entry.operators() {
            assert!(seen.insert(op), "operator {op} in two live entries");
        }
    }
}

#[test]
fn consuming_up_to_a_watermark_keeps_newer_entries() {
    let mut log = ChangeLog::new();
    let first = log.append(ChangeLogEntry::new([fresh_id()], [fresh_id()]));
    let _second = log.append(ChangeLogEntry::new([fresh_id()], [fresh_id()]));

    log.consume_up_to(first);
    assert_eq!(log.len(), 1);
    log.consume_up_to(log.last_timestamp());
    assert!(log.is_empty());
}
