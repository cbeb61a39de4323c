use osacct_core::{DbStatus, Host, InstanceType, RealmScope, RecordingEventSink};
use osacct_resolver::{AccountResolver, CaseStore, InstanceCache, ResolverConfig};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::NamedTempFile;

const CORP_SID: &str = "S-1-5-21-3623811015-3361044348-30300820";

fn user_sid(rid: u32) -> String {
    format!("{CORP_SID}-{rid}")
}

fn resolver_with(cache: Arc<InstanceCache>) -> AccountResolver {
    AccountResolver::new(&ResolverConfig::default(), cache)
}

fn count_rows(store: &CaseStore, sql: &str) -> i64 {
    store
        .connection()
        .query_row(sql, [], |row| row.get(0))
        .expect("count rows")
}

#[test]
fn resolving_again_with_a_login_enriches_the_same_account() {
    let mut store = CaseStore::open_in_memory().expect("open store");
    let resolver = resolver_with(Arc::new(InstanceCache::new()));
    let h1 = Host::new(1, "H1");
    let sid = user_sid(1001);

    let tx = store.begin().expect("begin");
    let a1 = resolver
        .resolve_windows_account(&tx, Some(sid.as_str()), None, Some("CORP"), &h1, RealmScope::Domain)
        .expect("first resolution");
    assert!(a1.login_name.is_none());
    tx.commit().expect("commit");

    let tx = store.begin().expect("begin");
    let again = resolver
        .resolve_windows_account(
            &tx,
            Some(sid.as_str()),
            Some("bob"),
            Some("CORP"),
            &h1,
            RealmScope::Domain,
        )
        .expect("second resolution");
    tx.commit().expect("commit");

    assert_eq!(again.id, a1.id);
    assert_eq!(again.login_name.as_deref(), Some("bob"));
    assert_eq!(again.signature, sid.to_lowercase());
    assert_eq!(count_rows(&store, "SELECT COUNT(*) FROM os_accounts"), 1);
}

#[test]
fn named_and_addressed_realms_collapse_into_one() {
    let sink = Arc::new(RecordingEventSink::new());
    let mut store = CaseStore::open_in_memory()
        .expect("open store")
        .with_event_sink(sink.clone());
    let resolver = resolver_with(Arc::new(InstanceCache::new()));
    let h1 = Host::new(1, "H1");

    let tx = store.begin().expect("begin");
    let named = resolver
        .realms()
        .get_or_create_realm(&tx, None, &["CORP"], Some(&h1), RealmScope::Domain)
        .expect("named realm")
        .realm;
    let addressed = resolver
        .realms()
        .get_or_create_realm(&tx, Some(CORP_SID), &[], Some(&h1), RealmScope::Domain)
        .expect("addressed realm")
        .realm;
    assert_ne!(named.id, addressed.id);

    resolver
        .get_or_create_account(&tx, Some(&named), None, Some("alice"))
        .expect("login-only account");
    resolver
        .get_or_create_account(&tx, Some(&addressed), Some(user_sid(1104).as_str()), None)
        .expect("addressed account");
    tx.commit().expect("commit setup");
    sink.drain();

    let tx = store.begin().expect("begin");
    let alice = resolver
        .resolve_windows_account(
            &tx,
            Some(user_sid(1104).as_str()),
            Some("alice"),
            Some("CORP"),
            &h1,
            RealmScope::Domain,
        )
        .expect("resolve with full identity");
    tx.commit().expect("commit");

    let realms = resolver
        .realms()
        .active_realms(store.connection())
        .expect("active realms");
    assert_eq!(realms.len(), 1);
    let realm = &realms[0];
    assert_eq!(realm.address.as_deref(), Some(CORP_SID));
    assert!(realm.has_name("corp"));
    assert_eq!(alice.realm_id, realm.id);

    let retired_id = if realm.id == named.id {
        addressed.id
    } else {
        named.id
    };
    let retired = resolver
        .realms()
        .get_realm(store.connection(), retired_id)
        .expect("load retired")
        .expect("retired realm is kept");
    assert_eq!(retired.db_status, DbStatus::Merged);
    assert_eq!(retired.merged_into, Some(realm.id));

    let accounts = resolver
        .active_accounts(store.connection())
        .expect("active accounts");
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].id, alice.id);
    assert_eq!(accounts[0].login_name.as_deref(), Some("alice"));
    assert_eq!(accounts[0].address.as_deref(), Some(user_sid(1104).as_str()));

    assert_eq!(sink.count("realms_merged"), 1);
    assert_eq!(sink.count("accounts_merged"), 1);
}

#[test]
fn concurrent_workers_resolve_to_one_account() {
    let db = NamedTempFile::new().expect("temp db");
    CaseStore::open(db.path()).expect("migrate once");

    let workers = 8;
    let cache = Arc::new(InstanceCache::new());
    let resolver = Arc::new(resolver_with(Arc::clone(&cache)));
    let barrier = Arc::new(Barrier::new(workers));
    let sid = user_sid(2001);

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let path = db.path().to_path_buf();
            let resolver = Arc::clone(&resolver);
            let barrier = Arc::clone(&barrier);
            let sid = sid.clone();
            thread::spawn(move || {
                let mut store = CaseStore::open(&path).expect("open worker store");
                let host = Host::new(1, "H1");
                barrier.wait();

                let tx = store.begin().expect("begin");
                let account = resolver
                    .resolve_windows_account(
                        &tx,
                        Some(sid.as_str()),
                        Some("svc-backup"),
                        Some("CORP"),
                        &host,
                        RealmScope::Domain,
                    )
                    .expect("resolve");
                resolver
                    .instances()
                    .record_instance(&tx, &account, 100 + worker as i64, InstanceType::Accessed)
                    .expect("record instance");
                tx.commit().expect("commit");
                account.id
            })
        })
        .collect();

    let ids: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker thread"))
        .collect();
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));

    let store = CaseStore::open(db.path()).expect("reopen");
    assert_eq!(count_rows(&store, "SELECT COUNT(*) FROM os_accounts"), 1);
    assert_eq!(count_rows(&store, "SELECT COUNT(*) FROM os_account_realms"), 1);
    assert_eq!(
        count_rows(&store, "SELECT COUNT(*) FROM os_account_instances"),
        workers as i64
    );
    assert_eq!(cache.len(), workers);
}

#[test]
fn instance_significance_only_moves_upward() {
    let cache = Arc::new(InstanceCache::new());
    let resolver = resolver_with(Arc::clone(&cache));
    let mut store = CaseStore::open_in_memory().expect("open store");
    let h1 = Host::new(1, "H1");

    let tx = store.begin().expect("begin");
    let account = resolver
        .resolve_windows_account(
            &tx,
            Some(user_sid(3001).as_str()),
            None,
            Some("CORP"),
            &h1,
            RealmScope::Domain,
        )
        .expect("account");
    tx.commit().expect("commit");

    let sequence = [
        InstanceType::Referenced,
        InstanceType::Accessed,
        InstanceType::Launched,
        InstanceType::Accessed,
        InstanceType::Referenced,
    ];
    let mut returned = Vec::new();
    for instance_type in sequence {
        let tx = store.begin().expect("begin");
        let instance = resolver
            .instances()
            .record_instance(&tx, &account, 7, instance_type)
            .expect("record");
        tx.commit().expect("commit");
        returned.push(instance.instance_type);
    }

    assert_eq!(
        returned,
        vec![
            InstanceType::Referenced,
            InstanceType::Accessed,
            InstanceType::Launched,
            InstanceType::Launched,
            InstanceType::Launched,
        ]
    );
    assert_eq!(
        count_rows(&store, "SELECT COUNT(*) FROM os_account_instances"),
        3
    );
    assert_eq!(
        cache.best(account.id, 7).map(|best| best.instance_type),
        Some(InstanceType::Launched)
    );
    let stored = resolver
        .instances()
        .most_significant_instance(store.connection(), account.id, 7)
        .expect("load")
        .expect("instance");
    assert_eq!(stored.instance_type, InstanceType::Launched);
}

#[test]
fn rolled_back_instances_never_reach_the_cache() {
    let cache = Arc::new(InstanceCache::new());
    let resolver = resolver_with(Arc::clone(&cache));
    let mut store = CaseStore::open_in_memory().expect("open store");
    let h1 = Host::new(1, "H1");

    let tx = store.begin().expect("begin");
    let account = resolver
        .resolve_windows_account(&tx, Some(user_sid(3002).as_str()), None, None, &h1, RealmScope::Local)
        .expect("account");
    resolver
        .instances()
        .record_instance(&tx, &account, 9, InstanceType::Launched)
        .expect("record");
    tx.rollback().expect("rollback");

    assert!(cache.is_empty());
    assert!(resolver
        .active_accounts(store.connection())
        .expect("accounts")
        .is_empty());
}

#[test]
fn file_owners_skip_groups_and_share_the_special_realm() {
    let sink = Arc::new(RecordingEventSink::new());
    let mut store = CaseStore::open_in_memory()
        .expect("open store")
        .with_event_sink(sink.clone());
    let resolver = resolver_with(Arc::new(InstanceCache::new()));
    let h1 = Host::new(1, "H1");

    let domain_users = user_sid(513);
    let tx = store.begin().expect("begin");
    for group in ["S-1-1-0", "S-1-5-32-544", "S-1-5-11", domain_users.as_str()] {
        let owner = resolver
            .ensure_owner_account(&tx, group, &h1, 1)
            .expect("group owner");
        assert!(owner.is_none(), "{group} is not a user");
    }

    let system = resolver
        .ensure_owner_account(&tx, "S-1-5-18", &h1, 1)
        .expect("system")
        .expect("system is a user");
    let service = resolver
        .ensure_owner_account(&tx, "S-1-5-80-956008885-3418522649-1831038044-1853292631", &h1, 1)
        .expect("service")
        .expect("virtual account");
    let backup = resolver
        .ensure_owner_account(&tx, "S-1-5-18.bak", &h1, 1)
        .expect("backup copy")
        .expect("system again");
    tx.commit().expect("commit");

    assert_eq!(system.realm_id, service.realm_id);
    assert_eq!(system.login_name.as_deref(), Some("SYSTEM"));
    assert_eq!(system.full_name.as_deref(), Some("Local System Account"));
    assert_eq!(service.full_name.as_deref(), Some("Service Virtual Account"));
    assert_ne!(backup.id, system.id);
    assert_eq!(backup.realm_id, system.realm_id);

    let realm = resolver
        .realms()
        .get_realm(store.connection(), system.realm_id)
        .expect("load")
        .expect("realm");
    assert_eq!(realm.address.as_deref(), Some("SPECIAL_WINDOWS_ACCOUNTS"));
    assert_eq!(realm.scope_host_id, Some(h1.id));
    assert_eq!(sink.count("instances_added"), 3);
    assert_eq!(
        count_rows(&store, "SELECT COUNT(*) FROM os_account_realms"),
        1
    );
}

#[test]
fn unknown_scope_follows_the_hosts_known_realms() {
    let mut store = CaseStore::open_in_memory().expect("open store");
    let resolver = resolver_with(Arc::new(InstanceCache::new()));
    let ws = Host::new(4, "WS04");
    let other = Host::new(5, "WS05");

    let tx = store.begin().expect("begin");
    let guessed = resolver
        .resolve_windows_account(
            &tx,
            Some("S-1-5-21-9-9-9-1001"),
            None,
            None,
            &other,
            RealmScope::Unknown,
        )
        .expect("guessed scope");
    let guessed_realm = resolver
        .realms()
        .get_realm(&tx, guessed.realm_id)
        .expect("load")
        .expect("realm");
    assert_eq!(guessed_realm.scope_host_id, Some(other.id));

    resolver
        .resolve_windows_account(
            &tx,
            Some("S-1-5-21-4-4-4-500"),
            Some("Administrator"),
            Some("WS04"),
            &ws,
            RealmScope::Local,
        )
        .expect("local admin");
    let domain_user = resolver
        .resolve_windows_account(
            &tx,
            Some(user_sid(4001).as_str()),
            Some("erin"),
            None,
            &ws,
            RealmScope::Unknown,
        )
        .expect("domain user");
    let domain_realm = resolver
        .realms()
        .get_realm(&tx, domain_user.realm_id)
        .expect("load")
        .expect("realm");
    assert!(domain_realm.is_domain_scoped());
    tx.commit().expect("commit");
}

#[test]
fn realm_collapse_joins_a_split_identity_in_the_surviving_realm() {
    let sink = Arc::new(RecordingEventSink::new());
    let mut store = CaseStore::open_in_memory()
        .expect("open store")
        .with_event_sink(sink.clone());
    let resolver = resolver_with(Arc::new(InstanceCache::new()));
    let h1 = Host::new(1, "H1");
    let sid = user_sid(1200);

    let tx = store.begin().expect("begin");
    let addressed = resolver
        .realms()
        .get_or_create_realm(&tx, Some(CORP_SID), &[], Some(&h1), RealmScope::Domain)
        .expect("addressed realm")
        .realm;
    let named = resolver
        .realms()
        .get_or_create_realm(&tx, None, &["CORP"], Some(&h1), RealmScope::Domain)
        .expect("named realm")
        .realm;
    resolver
        .get_or_create_account(&tx, Some(&addressed), None, Some("bob"))
        .expect("login-only bob");
    let address_only = resolver
        .get_or_create_account(&tx, Some(&addressed), Some(sid.as_str()), None)
        .expect("address-only bob");
    resolver
        .get_or_create_account(&tx, Some(&named), Some(sid.as_str()), Some("bob"))
        .expect("full bob");
    tx.commit().expect("commit setup");
    sink.drain();

    let tx = store.begin().expect("begin");
    let bob = resolver
        .resolve_windows_account(
            &tx,
            Some(sid.as_str()),
            Some("bob"),
            Some("CORP"),
            &h1,
            RealmScope::Domain,
        )
        .expect("resolve bob");
    tx.commit().expect("commit");

    assert_eq!(bob.id, address_only.id);
    assert_eq!(bob.realm_id, addressed.id);
    let accounts = resolver
        .active_accounts(store.connection())
        .expect("active accounts");
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].login_name.as_deref(), Some("bob"));
    assert_eq!(accounts[0].address.as_deref(), Some(sid.as_str()));
    assert_eq!(
        resolver
            .realms()
            .active_realms(store.connection())
            .expect("active realms")
            .len(),
        1
    );
    assert_eq!(sink.count("realms_merged"), 1);
    assert_eq!(sink.count("accounts_merged"), 2);
}

#[test]
fn one_update_revealing_several_collisions_leaves_one_realm() {
    let mut store = CaseStore::open_in_memory().expect("open store");
    let resolver = resolver_with(Arc::new(InstanceCache::new()));
    let h1 = Host::new(1, "H1");

    let tx = store.begin().expect("begin");
    for name in ["CORP", "CORP.LOCAL"] {
        let realm = resolver
            .realms()
            .get_or_create_realm(&tx, None, &[name], Some(&h1), RealmScope::Domain)
            .expect("named realm")
            .realm;
        resolver
            .get_or_create_account(&tx, Some(&realm), None, Some("svc-sql"))
            .expect("login-only account");
    }
    let addressed = resolver
        .realms()
        .get_or_create_realm(&tx, Some(CORP_SID), &[], Some(&h1), RealmScope::Domain)
        .expect("addressed realm")
        .realm;

    let resolution = resolver
        .realms()
        .get_or_create_realm(
            &tx,
            Some(CORP_SID),
            &["CORP", "CORP.LOCAL"],
            Some(&h1),
            RealmScope::Domain,
        )
        .expect("update realm");
    assert_eq!(resolution.merge_required.len(), 2);
    let mut realm = resolution.realm;
    for duplicate in &resolution.merge_required {
        realm = resolver
            .merges()
            .merge_realms(&tx, duplicate, &realm)
            .expect("merge realm");
    }
    tx.commit().expect("commit");

    let realms = resolver
        .realms()
        .active_realms(store.connection())
        .expect("active realms");
    assert_eq!(realms.len(), 1);
    assert_eq!(realms[0].id, addressed.id);
    assert!(realms[0].has_name("corp") && realms[0].has_name("corp.local"));
    assert_eq!(
        realms[0].signature,
        format!("{}_domain", CORP_SID.to_lowercase())
    );

    let accounts = resolver
        .accounts_in_realm(store.connection(), addressed.id)
        .expect("accounts");
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].login_name.as_deref(), Some("svc-sql"));
}
