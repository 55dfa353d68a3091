use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::{json, Value};

use bucket_migrator::migrate::records::{migrate_records, stale_filter};
use bucket_migrator::model::network;
use bucket_migrator::store::memory::MemoryStore;
use bucket_migrator::store::{BucketSchema, BucketState, IndexType, ReadMode};
use bucket_migrator::{BucketStore, Filter};

fn field() -> impl Strategy<Value = String> {
    "[a-z][a-z_]{0,6}"
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        r"[a-z0-9()*\\]{0,6}".prop_map(Value::from),
    ]
}

fn filter() -> impl Strategy<Value = Filter> {
    let leaf = prop_oneof![
        field().prop_map(Filter::Present),
        (field(), scalar()).prop_map(|(f, v)| Filter::Eq(f, v)),
        (field(), scalar()).prop_map(|(f, v)| Filter::Le(f, v)),
        (field(), scalar()).prop_map(|(f, v)| Filter::Ge(f, v)),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(Filter::And),
            prop::collection::vec(inner.clone(), 1..4).prop_map(Filter::Or),
            inner.prop_map(Filter::not),
        ]
    })
}

fn attrs() -> impl Strategy<Value = BTreeMap<String, Value>> {
    prop::collection::btree_map(field(), scalar(), 0..6)
}

fn marker_attrs(marker: Option<u32>) -> BTreeMap<String, Value> {
    let mut attrs = BTreeMap::new();
    attrs.insert("name".to_string(), json!("admin"));
    if let Some(v) = marker {
        attrs.insert("v".to_string(), json!(v));
    }
    attrs
}

proptest! {
    #[test]
    fn stale_filter_selects_only_older_markers(target in 0u32..50, marker in prop::option::of(0u32..60)) {
        let selected = stale_filter(target).matches(&marker_attrs(marker));
        let stale = marker.map_or(true, |m| m < target);
        prop_assert_eq!(selected, stale);
    }

    #[test]
    fn negation_inverts_every_filter(f in filter(), record in attrs()) {
        prop_assert_eq!(Filter::not(f.clone()).matches(&record), !f.matches(&record));
    }

    #[test]
    fn conjunction_requires_every_part(parts in prop::collection::vec(filter(), 1..4), record in attrs()) {
        let all = parts.iter().all(|f| f.matches(&record));
        let any = parts.iter().any(|f| f.matches(&record));
        prop_assert_eq!(Filter::And(parts.clone()).matches(&record), all);
        prop_assert_eq!(Filter::Or(parts).matches(&record), any);
    }

    #[test]
    fn rendered_values_escape_specials(name in field(), value in r"[a-z()*\\]{0,8}") {
        let text = Filter::eq(name.clone(), value.clone()).to_string();
        let body = &text[name.len() + 2..text.len() - 1];
        let mut chars = body.chars();
        let mut unescaped = String::new();
        while let Some(c) = chars.next() {
            if c == '\\' {
                let next = chars.next();
                prop_assert!(matches!(next, Some('(' | ')' | '*' | '\\')));
                unescaped.extend(next);
            } else {
                prop_assert!(!matches!(c, '(' | ')' | '*'));
                unescaped.push(c);
            }
        }
        prop_assert_eq!(unescaped, value);
    }

    #[test]
    fn migration_reaches_every_record_once(count in 0u32..40, page_size in 1usize..12) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let store = MemoryStore::new();
            let legacy = BucketState {
                schema: BucketSchema::new().with_index("name", IndexType::String),
                version: 1,
            };
            store.create_bucket(network::BUCKET, &legacy).await.unwrap();
            store
                .seed(
                    network::BUCKET,
                    (0..count).map(|i| {
                        (
                            format!("net-{i:03}"),
                            json!({
                                "uuid": format!("net-{i:03}"),
                                "name": format!("admin{i}"),
                                "vlan_id": i,
                                "nic_tag": "external",
                                "subnet": "10.0.0.0/24",
                                "provision_start_ip": "10.0.0.10",
                                "provision_end_ip": "10.0.0.250",
                            }),
                        )
                    }),
                )
                .unwrap();

            let def = network::definition();
            store.update_bucket(network::BUCKET, &def.target_state()).await.unwrap();
            store.reindex(network::BUCKET, 1000, ReadMode::Fresh).await.unwrap();

            assert_eq!(migrate_records(&store, &def, page_size).await.unwrap(), u64::from(count));
            let writes = store.write_count();
            assert_eq!(migrate_records(&store, &def, page_size).await.unwrap(), 0);
            assert_eq!(store.write_count(), writes);
        });
    }
}
