use std::collections::BTreeMap;

use agency_portal_core::{
    merge_records, merge_summaries, run_query, CategorySummary, Cents, FieldValue, PortalRecord,
    TenantBatch, TenantId, TriState, ViewConfig, ViewKind, ViewState,
};
use criterion::{criterion_group, criterion_main, Criterion};
use time::{Duration, OffsetDateTime};

const CARRIERS: [&str; 4] = ["Acme Life", "Blue Shield", "Cigna", "Delta Mutual"];
const STATUSES: [&str; 3] = ["Paid", "Pending", "Chargeback"];

fn mk_record(tenant: &TenantId, index: usize) -> PortalRecord {
    let offset = i64::try_from(index).unwrap_or(i64::MAX);
    PortalRecord::new(tenant.clone(), format!("c-{index}"))
        .with_amount(Cents(10_000 + offset * 7))
        .with_created_at(OffsetDateTime::UNIX_EPOCH + Duration::minutes(offset))
        .with_text("client_name", format!("Client {index}"))
        .with_text("agent_name", format!("Agent {}", index % 25))
        .with_text("carrier", CARRIERS[index % CARRIERS.len()])
        .with_text("status", STATUSES[index % STATUSES.len()])
        .with_field("locked", FieldValue::Flag(index % 5 == 0))
}

fn mk_batches(tenants: usize, per_tenant: usize) -> (Vec<TenantBatch<Vec<PortalRecord>>>, BTreeMap<TenantId, String>) {
    let mut names = BTreeMap::new();
    let batches = (0..tenants)
        .map(|tenant_index| {
            let tenant = TenantId::new(format!("agency-{tenant_index}"));
            names.insert(tenant.clone(), format!("Agency {tenant_index}"));
            let records = (0..per_tenant).map(|index| mk_record(&tenant, index)).collect();
            TenantBatch::new(tenant, records)
        })
        .collect();
    (batches, names)
}

fn bench_query(c: &mut Criterion) {
    let (batches, names) = mk_batches(4, 2_500);
    let records = merge_records(batches, &names);
    let config = ViewConfig::preset(ViewKind::Commissions);
    let mut state = ViewState::defaults(&config);
    state.set_search_term("client 1");
    state.toggle_facet_value("carrier", "Acme Life");
    state.toggle_facet_value("carrier", "Cigna");
    state.set_toggle("locked", TriState::No);

    c.bench_function("commissions_query_10000_records", |b| {
        b.iter(|| {
            let window = run_query(&records, &config, &state);
            if window.total_matching() == 0 {
                panic!("query benchmark matched nothing");
            }
        });
    });
}

fn bench_merge(c: &mut Criterion) {
    let results = (0..50)
        .map(|tenant| {
            (0..40)
                .map(|category| CategorySummary {
                    id: format!("{tenant}-{category}"),
                    label: format!("Category {category}"),
                    total: Cents(i64::from(category) * 1_000),
                    records: 3,
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    c.bench_function("merge_summaries_50_tenants", |b| {
        b.iter(|| {
            let merged = merge_summaries(&results);
            if merged.len() != 40 {
                panic!("merge benchmark produced {} categories", merged.len());
            }
        });
    });
}

criterion_group!(pipeline_benches, bench_query, bench_merge);
criterion_main!(pipeline_benches);
