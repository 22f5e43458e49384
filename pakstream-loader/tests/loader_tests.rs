use pakstream_base::{LoadPriority, SymbolIndex};
use pakstream_loader::{
    ExportEntry, ImportEntry, LoadError, LoadResult, NameHandle, ObjectFactory, ObjectFinalizer,
    ObjectRef, ObjectSpawnDesc, PackageLoadManager, PackageSummary, ResolvedReferences,
    TickBudget,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

//
// Recording object model. Objects are plain ids; every factory and
// finalizer call is recorded so tests can assert on ordering and content.
//

#[derive(Default)]
struct ModelState {
    next_object: u64,
    next_name: u64,
    names: HashMap<String, u64>,
    name_text: HashMap<u64, String>,
    /// object id -> object name
    allocated: HashMap<u64, String>,
    reachable: Vec<u64>,
    /// object id -> (resolved reference ids, trailing payload bytes)
    deserialized: HashMap<u64, (Vec<u64>, Vec<u8>)>,
    /// objects whose payload has landed (or that were seeded as resident)
    formed: Vec<u64>,
    events: Vec<String>,
    fixed_up: Vec<u64>,
    cleared: Vec<u64>,
    load_failed: Vec<u64>,
    /// (package name, object name) -> already-resident object
    resident: HashMap<(String, String), u64>,
}

impl ModelState {
    fn seed_resident(
        &mut self,
        package: &str,
        name: &str,
    ) -> u64 {
        self.next_object += 1;
        let id = self.next_object;
        self.allocated.insert(id, name.to_string());
        self.formed.push(id);
        self.resident
            .insert((package.to_string(), name.to_string()), id);
        id
    }
}

#[derive(Clone)]
struct TestFactory {
    state: Arc<Mutex<ModelState>>,
}

impl ObjectFactory for TestFactory {
    fn resolve_or_intern_name(
        &mut self,
        text: &str,
    ) -> NameHandle {
        let mut state = self.state.lock().unwrap();
        if let Some(&id) = state.names.get(text) {
            return NameHandle(id);
        }
        state.next_name += 1;
        let id = state.next_name;
        state.names.insert(text.to_string(), id);
        state.name_text.insert(id, text.to_string());
        NameHandle(id)
    }

    fn allocate_object(
        &mut self,
        desc: &ObjectSpawnDesc,
    ) -> ObjectRef {
        let mut state = self.state.lock().unwrap();
        state.next_object += 1;
        let id = state.next_object;
        let name = state
            .name_text
            .get(&desc.name.0)
            .cloned()
            .unwrap_or_default();
        state.allocated.insert(id, name.clone());
        state.events.push(format!("alloc {}", name));
        ObjectRef(id)
    }

    fn deserialize_object(
        &mut self,
        object: ObjectRef,
        payload: &[u8],
        refs: &ResolvedReferences<'_>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (symbols, rest) = decode_payload(payload);
        let resolved: Vec<u64> = symbols.iter().map(|&s| refs.resolve(s).0).collect();

        let mut state = self.state.lock().unwrap();
        let name = state.allocated.get(&object.0).cloned().unwrap_or_default();
        state.events.push(format!("deser {}", name));
        state.deserialized.insert(object.0, (resolved, rest));
        state.formed.push(object.0);
        Ok(())
    }

    fn mark_reachable_while_loading(
        &mut self,
        object: ObjectRef,
    ) {
        self.state.lock().unwrap().reachable.push(object.0);
    }

    fn is_class_fully_formed(
        &self,
        class: ObjectRef,
    ) -> bool {
        self.state.lock().unwrap().formed.contains(&class.0)
    }

    fn find_existing_object(
        &self,
        _class_name: &str,
        package: &str,
        name: &str,
    ) -> Option<ObjectRef> {
        self.state
            .lock()
            .unwrap()
            .resident
            .get(&(package.to_string(), name.to_string()))
            .map(|&id| ObjectRef(id))
    }
}

struct TestFinalizer {
    state: Arc<Mutex<ModelState>>,
}

impl ObjectFinalizer for TestFinalizer {
    fn post_deserialize_fixup(
        &mut self,
        object: ObjectRef,
    ) {
        self.state.lock().unwrap().fixed_up.push(object.0);
    }

    fn clear_loader_flags(
        &mut self,
        object: ObjectRef,
    ) {
        self.state.lock().unwrap().cleared.push(object.0);
    }

    fn mark_load_failed(
        &mut self,
        object: ObjectRef,
    ) {
        self.state.lock().unwrap().load_failed.push(object.0);
    }
}

//
// Payload codec for the test object model: a count byte, that many i32
// little-endian symbol indices to resolve at deserialize time, then
// arbitrary trailing bytes.
//

fn encode_symbol(symbol: SymbolIndex) -> i32 {
    if let Some(e) = symbol.export_index() {
        e as i32 + 1
    } else if let Some(i) = symbol.import_index() {
        -(i as i32 + 1)
    } else {
        0
    }
}

fn decode_symbol(raw: i32) -> SymbolIndex {
    if raw > 0 {
        SymbolIndex::from_export(raw as usize - 1)
    } else if raw < 0 {
        SymbolIndex::from_import((-raw) as usize - 1)
    } else {
        SymbolIndex::null()
    }
}

fn payload(
    refs: &[SymbolIndex],
    rest: &[u8],
) -> Vec<u8> {
    let mut out = vec![refs.len() as u8];
    for &r in refs {
        out.extend_from_slice(&encode_symbol(r).to_le_bytes());
    }
    out.extend_from_slice(rest);
    out
}

fn decode_payload(data: &[u8]) -> (Vec<SymbolIndex>, Vec<u8>) {
    let count = data[0] as usize;
    let mut symbols = Vec::with_capacity(count);
    for k in 0..count {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&data[1 + k * 4..5 + k * 4]);
        symbols.push(decode_symbol(i32::from_le_bytes(raw)));
    }
    (symbols, data[1 + count * 4..].to_vec())
}

//
// On-disk fixture builder
//

struct PackageBuilder {
    summary: PackageSummary,
    payloads: Vec<Vec<u8>>,
}

impl PackageBuilder {
    fn new() -> Self {
        PackageBuilder {
            summary: PackageSummary::new(Uuid::new_v4()),
            payloads: Vec::default(),
        }
    }

    fn export(
        &mut self,
        name: &str,
        class_index: SymbolIndex,
        payload: Vec<u8>,
    ) -> SymbolIndex {
        self.export_full(name, class_index, SymbolIndex::null(), SymbolIndex::null(), payload, &[])
    }

    fn export_full(
        &mut self,
        name: &str,
        class_index: SymbolIndex,
        outer_index: SymbolIndex,
        template_index: SymbolIndex,
        payload: Vec<u8>,
        serialize_before: &[SymbolIndex],
    ) -> SymbolIndex {
        let index = self.summary.exports.len();
        self.summary.exports.push(ExportEntry {
            object_name: name.to_string(),
            class_index,
            super_index: SymbolIndex::null(),
            outer_index,
            template_index,
            serial_offset: 0,
            serial_size: payload.len() as u64,
        });
        self.summary.serialize_before.push(serialize_before.to_vec());
        self.payloads.push(payload);
        SymbolIndex::from_export(index)
    }

    fn import(
        &mut self,
        source_package: &str,
        class_name: &str,
        name: &str,
    ) -> SymbolIndex {
        let index = self.summary.imports.len();
        self.summary.imports.push(ImportEntry {
            object_name: name.to_string(),
            class_name: class_name.to_string(),
            outer_index: SymbolIndex::null(),
            source_package: source_package.to_string(),
        });
        SymbolIndex::from_import(index)
    }

    fn write(
        mut self,
        dir: &Path,
        package_name: &str,
    ) {
        // Header size does not depend on the offsets written into it, so a
        // probe pass is enough to lay the payloads out
        let mut probe = Vec::default();
        let header_len = self.summary.write_header(&mut probe).unwrap();

        let mut offset = header_len;
        for (entry, payload) in self.summary.exports.iter_mut().zip(&self.payloads) {
            entry.serial_offset = offset;
            offset += payload.len() as u64;
        }

        let mut file =
            std::fs::File::create(dir.join(format!("{}.pak", package_name))).unwrap();
        self.summary.write_header(&mut file).unwrap();
        for payload in &self.payloads {
            file.write_all(payload).unwrap();
        }
    }
}

fn make_manager(dir: &Path) -> (PackageLoadManager, Arc<Mutex<ModelState>>) {
    let state = Arc::new(Mutex::new(ModelState::default()));
    let manager = PackageLoadManager::new(
        Box::new(TestFactory {
            state: state.clone(),
        }),
        Box::new(TestFinalizer {
            state: state.clone(),
        }),
        dir.to_path_buf(),
    );
    (manager, state)
}

fn record_result(results: &Arc<Mutex<Vec<LoadResult>>>) -> impl FnOnce(LoadResult) + Send {
    let results = results.clone();
    move |result| results.lock().unwrap().push(result)
}

//
// Tests
//

#[test]
fn loads_single_package_and_runs_fixup() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pkg = PackageBuilder::new();
    let class = pkg.export("WidgetClass", SymbolIndex::null(), payload(&[], b"class-bytes"));
    pkg.export("Widget", class, payload(&[class], b"widget-bytes"));
    pkg.write(dir.path(), "ui");

    let (mut manager, state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    let request = manager.load_async("ui", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.is_loading());
    assert!(manager.flush(request));

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_succeeded());

    let state = state.lock().unwrap();
    assert_eq!(state.allocated.len(), 2);
    assert_eq!(state.deserialized.len(), 2);
    let widget_id = *state
        .allocated
        .iter()
        .find(|(_, name)| name.as_str() == "Widget")
        .unwrap()
        .0;
    let (refs, rest) = &state.deserialized[&widget_id];
    assert_eq!(rest, b"widget-bytes");
    // The class reference resolved to a live object
    assert_eq!(refs.len(), 1);
    assert_ne!(refs[0], 0);
    // Every object was guarded while loading, fixed up and published
    assert_eq!(state.reachable.len(), 2);
    assert_eq!(state.fixed_up.len(), 2);
    assert_eq!(state.cleared.len(), 2);
    assert!(state.load_failed.is_empty());
    drop(state);
    assert!(!manager.is_loading());
    assert_eq!(manager.active_load_count(), 0);
}

#[test]
fn class_payload_lands_before_instances_are_constructed() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pkg = PackageBuilder::new();
    let class = pkg.export("EnemyClass", SymbolIndex::null(), payload(&[], b"vtable"));
    pkg.export("Enemy", class, payload(&[], b"enemy"));
    pkg.write(dir.path(), "spawn");

    let (mut manager, state) = make_manager(dir.path());
    let request = manager.load_async("spawn", None, LoadPriority::NORMAL, |_| {});
    assert!(manager.flush(request));

    let state = state.lock().unwrap();
    let events = &state.events;
    let class_done = events.iter().position(|e| e == "deser EnemyClass").unwrap();
    let instance_made = events.iter().position(|e| e == "alloc Enemy").unwrap();
    assert!(
        class_done < instance_made,
        "instance built before its class finished: {:?}",
        events
    );
}

#[test]
fn consumer_resolves_imports_from_provider_package() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    let mut core = PackageBuilder::new();
    core.export("ClassA", SymbolIndex::null(), payload(&[], b"class-a"));
    core.export("MeshProto", SymbolIndex::null(), payload(&[], b"proto"));
    core.write(dir.path(), "core");

    let mut level = PackageBuilder::new();
    let imp_class = level.import("core", "Class", "ClassA");
    let imp_proto = level.import("core", "ClassA", "MeshProto");
    let obj1 = level.export_full(
        "Obj1",
        imp_class,
        SymbolIndex::null(),
        SymbolIndex::null(),
        payload(&[imp_class], b"one"),
        &[],
    );
    level.export_full(
        "Obj2",
        imp_class,
        SymbolIndex::null(),
        imp_proto,
        payload(&[imp_proto], b"two"),
        &[imp_proto],
    );
    level.export_full(
        "Obj3",
        imp_class,
        obj1,
        SymbolIndex::null(),
        payload(&[obj1], b"three"),
        &[obj1],
    );
    level.write(dir.path(), "level");

    let (mut manager, state) = make_manager(dir.path());
    let callback_state = state.clone();
    let results = Arc::new(Mutex::new(Vec::new()));
    let callback_results = results.clone();
    let request = manager.load_async("level", None, LoadPriority::NORMAL, move |result| {
        // No premature completion: every object of the package must have its
        // payload by the time the callback runs
        let state = callback_state.lock().unwrap();
        assert_eq!(
            state
                .deserialized
                .values()
                .filter(|(_, rest)| [b"one".as_slice(), b"two", b"three"].contains(&rest.as_slice()))
                .count(),
            3
        );
        callback_results.lock().unwrap().push(result);
    });
    assert!(manager.flush(request));
    assert!(manager.flush_all());

    assert!(results.lock().unwrap()[0].is_succeeded());
    let state = state.lock().unwrap();
    // 2 provider objects + 3 consumer objects
    assert_eq!(state.allocated.len(), 5);
    assert_eq!(state.deserialized.len(), 5);
    for (refs, _) in state.deserialized.values() {
        for &r in refs {
            assert_ne!(r, 0, "a cross-package reference degraded to null");
        }
    }
    drop(state);
    assert_eq!(manager.active_load_count(), 0);
}

#[test]
fn duplicate_requests_merge_into_one_load() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pkg = PackageBuilder::new();
    pkg.export("Solo", SymbolIndex::null(), payload(&[], b"solo"));
    pkg.write(dir.path(), "dup");

    let (mut manager, state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    let first = manager.load_async("dup", None, LoadPriority::NORMAL, record_result(&results));
    let second = manager.load_async("dup", None, LoadPriority::HIGH, record_result(&results));
    assert_ne!(first, second);
    assert!(manager.flush(first));
    assert!(manager.flush(second));

    // Both callbacks ran, but the package was loaded once
    assert_eq!(results.lock().unwrap().len(), 2);
    assert!(results.lock().unwrap().iter().all(|r| r.is_succeeded()));
    assert_eq!(state.lock().unwrap().allocated.len(), 1);
}

#[test]
fn mutually_importing_packages_both_complete() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    // a.X's payload waits for b.Y's payload; b.Y only needs a.X to exist
    // (as its template), so the cross-package wait is not circular.
    let mut a = PackageBuilder::new();
    let imp_y = a.import("b", "", "Y");
    a.export_full(
        "X",
        SymbolIndex::null(),
        SymbolIndex::null(),
        SymbolIndex::null(),
        payload(&[imp_y], b"x-payload"),
        &[imp_y],
    );
    a.write(dir.path(), "a");

    let mut b = PackageBuilder::new();
    let imp_x = b.import("a", "", "X");
    b.export_full(
        "Y",
        SymbolIndex::null(),
        SymbolIndex::null(),
        imp_x,
        payload(&[imp_x], b"y-payload"),
        &[],
    );
    b.write(dir.path(), "b");

    let (mut manager, state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    manager.load_async("a", None, LoadPriority::NORMAL, record_result(&results));
    manager.load_async("b", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.flush_all());

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_succeeded()));

    let state = state.lock().unwrap();
    assert_eq!(state.deserialized.len(), 2);
    for (refs, _) in state.deserialized.values() {
        assert_eq!(refs.len(), 1);
        assert_ne!(refs[0], 0, "cyclic cross-reference degraded to null");
    }
}

#[test]
fn missing_package_fails_and_is_cached() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, _state) = make_manager(dir.path());

    let results = Arc::new(Mutex::new(Vec::new()));
    let first = manager.load_async("ghost", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.flush(first));
    assert_eq!(manager.known_missing_hits(), 0);

    // Second request short-circuits without touching disk
    let second = manager.load_async("ghost", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.flush(second));
    assert_eq!(manager.known_missing_hits(), 1);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    for result in results.iter() {
        match result {
            LoadResult::Failed(error) => {
                assert!(matches!(**error, LoadError::FileNotFound { .. }))
            }
            other => panic!("expected FileNotFound, got {:?}", other),
        }
    }
}

#[test]
fn malformed_header_fails_the_package_only() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("broken.pak"), vec![0xffu8; 256]).unwrap();
    let mut good = PackageBuilder::new();
    good.export("Ok", SymbolIndex::null(), payload(&[], b"ok"));
    good.write(dir.path(), "good");

    let (mut manager, _state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    manager.load_async("broken", None, LoadPriority::NORMAL, record_result(&results));
    manager.load_async("good", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.flush_all());

    let results = results.lock().unwrap();
    let failed = results
        .iter()
        .filter(|r| matches!(r, LoadResult::Failed(e) if matches!(**e, LoadError::MalformedHeader { .. })))
        .count();
    let succeeded = results.iter().filter(|r| r.is_succeeded()).count();
    assert_eq!((failed, succeeded), (1, 1));
}

#[test]
fn unresolvable_class_import_fails_the_package() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pkg = PackageBuilder::new();
    let imp = pkg.import("void", "Class", "NoSuchClass");
    pkg.export("Orphan", imp, payload(&[], b"orphan"));
    pkg.write(dir.path(), "lost");

    let (mut manager, state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    let request = manager.load_async("lost", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.flush(request));

    let results = results.lock().unwrap();
    match &results[0] {
        LoadResult::Failed(error) => {
            assert!(matches!(**error, LoadError::SymbolResolutionFailed { .. }))
        }
        other => panic!("expected SymbolResolutionFailed, got {:?}", other),
    }
    // Nothing from the failed package was published
    assert!(state.lock().unwrap().cleared.is_empty());
}

#[test]
fn imports_fall_back_to_resident_objects() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pkg = PackageBuilder::new();
    let imp = pkg.import("core", "Class", "ClassA");
    pkg.export("Thing", imp, payload(&[imp], b"thing"));
    pkg.write(dir.path(), "standalone");

    let (mut manager, state) = make_manager(dir.path());
    // "core" has no package file, but its class object is already in memory
    let resident_id = state.lock().unwrap().seed_resident("core", "ClassA");

    let results = Arc::new(Mutex::new(Vec::new()));
    let request =
        manager.load_async("standalone", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.flush(request));

    assert!(results.lock().unwrap()[0].is_succeeded());
    let state = state.lock().unwrap();
    let thing_id = *state
        .allocated
        .iter()
        .find(|(_, name)| name.as_str() == "Thing")
        .unwrap()
        .0;
    assert_eq!(state.deserialized[&thing_id].0, vec![resident_id]);
}

#[test]
fn zero_budget_ticks_defer_symbol_work() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pkg = PackageBuilder::new();
    pkg.export("Deferred", SymbolIndex::null(), payload(&[], b"later"));
    pkg.write(dir.path(), "slow");

    let (mut manager, state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    let request = manager.load_async("slow", None, LoadPriority::NORMAL, record_result(&results));

    // Header reads and parsing may proceed, but no objects may be touched
    let zero = TickBudget::with_limit(Duration::ZERO);
    for _ in 0..50 {
        manager.update(&zero);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(state.lock().unwrap().allocated.is_empty());
    assert!(results.lock().unwrap().is_empty());
    assert!(manager.is_loading());

    assert!(manager.flush(request));
    assert!(results.lock().unwrap()[0].is_succeeded());
    assert_eq!(state.lock().unwrap().allocated.len(), 1);
}

#[test]
fn cancel_all_reports_canceled() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pkg = PackageBuilder::new();
    pkg.export("Doomed", SymbolIndex::null(), payload(&[], b"doomed"));
    pkg.write(dir.path(), "victim");

    let (mut manager, _state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    manager.load_async("victim", None, LoadPriority::NORMAL, record_result(&results));
    // Cancel lands in the same intake drain as the load, before any work
    manager.cancel_all();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], LoadResult::Canceled));
    assert!(!manager.is_loading());
}

#[test]
fn unreferenced_import_still_gates_completion() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    let mut lib = PackageBuilder::new();
    lib.export("Shared", SymbolIndex::null(), payload(&[], b"shared"));
    lib.write(dir.path(), "lib");

    // "app" declares an import nothing in its export table depends on; the
    // import must still run to completion before the package finalizes.
    let mut app = PackageBuilder::new();
    app.import("lib", "", "Shared");
    app.export("Main", SymbolIndex::null(), payload(&[], b"main"));
    app.write(dir.path(), "app");

    let (mut manager, state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    let request = manager.load_async("app", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.flush(request));
    assert!(manager.flush_all());

    assert!(results.lock().unwrap()[0].is_succeeded());
    let state = state.lock().unwrap();
    assert_eq!(state.allocated.len(), 2);
    drop(state);
    assert_eq!(manager.active_load_count(), 0);
}

#[test]
fn payload_reference_to_missing_import_degrades_to_null() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pkg = PackageBuilder::new();
    // "nowhere" has no package file; the reference is payload-only, so the
    // symbol degrades instead of failing the load
    let imp = pkg.import("nowhere", "", "Gadget");
    pkg.export("Holder", SymbolIndex::null(), payload(&[imp], b"holder"));
    pkg.write(dir.path(), "tolerant");

    let (mut manager, state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    let request =
        manager.load_async("tolerant", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.flush(request));

    assert!(results.lock().unwrap()[0].is_succeeded());
    let state = state.lock().unwrap();
    let holder_id = *state
        .allocated
        .iter()
        .find(|(_, name)| name.as_str() == "Holder")
        .unwrap()
        .0;
    assert_eq!(state.deserialized[&holder_id].0, vec![0]);
}

#[test]
fn self_import_is_rejected_as_malformed() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pkg = PackageBuilder::new();
    let imp = pkg.import("selfish", "", "Me");
    pkg.export("Me", SymbolIndex::null(), payload(&[imp], b"me"));
    pkg.write(dir.path(), "selfish");

    let (mut manager, _state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    let request =
        manager.load_async("selfish", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.flush(request));

    let results = results.lock().unwrap();
    match &results[0] {
        LoadResult::Failed(error) => {
            assert!(matches!(**error, LoadError::MalformedHeader { .. }))
        }
        other => panic!("expected MalformedHeader, got {:?}", other),
    }
}

#[test]
fn unservable_payload_ordering_fails_instead_of_hanging() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    // "First" sits at the start of the data area but its payload depends on
    // "Last", which sits past a window-sized gap. The single resident read
    // window can never hold Last's bytes while First still needs its own, so
    // the load cannot finish; it must fail rather than hang the flush.
    let first_payload = payload(&[], b"first");
    let last_payload = payload(&[], b"last");
    let mut summary = PackageSummary::new(Uuid::from_u128(9));
    for name in ["First", "Last"] {
        summary.exports.push(ExportEntry {
            object_name: name.to_string(),
            class_index: SymbolIndex::null(),
            super_index: SymbolIndex::null(),
            outer_index: SymbolIndex::null(),
            template_index: SymbolIndex::null(),
            serial_offset: 0,
            serial_size: 0,
        });
    }
    summary.serialize_before.push(vec![SymbolIndex::from_export(1)]);
    summary.serialize_before.push(vec![]);

    let mut probe = Vec::default();
    let header_len = summary.write_header(&mut probe).unwrap();
    let gap = 2u64 << 20;
    summary.exports[0].serial_offset = header_len;
    summary.exports[0].serial_size = first_payload.len() as u64;
    summary.exports[1].serial_offset = header_len + gap;
    summary.exports[1].serial_size = last_payload.len() as u64;

    let mut file = std::fs::File::create(dir.path().join("twisted.pak")).unwrap();
    summary.write_header(&mut file).unwrap();
    file.write_all(&first_payload).unwrap();
    file.write_all(&vec![0u8; gap as usize - first_payload.len()]).unwrap();
    file.write_all(&last_payload).unwrap();

    let (mut manager, _state) = make_manager(dir.path());
    let results = Arc::new(Mutex::new(Vec::new()));
    let request =
        manager.load_async("twisted", None, LoadPriority::NORMAL, record_result(&results));
    assert!(manager.flush(request));

    let results = results.lock().unwrap();
    match &results[0] {
        LoadResult::Failed(error) => {
            assert!(matches!(**error, LoadError::Stalled { .. }))
        }
        other => panic!("expected Stalled, got {:?}", other),
    }
    drop(results);
    assert!(!manager.is_loading());
}

#[test]
fn merged_priority_schedules_ahead_of_normal_loads() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut back = PackageBuilder::new();
    back.export("BackObj", SymbolIndex::null(), payload(&[], b"back"));
    back.write(dir.path(), "back");
    let mut front = PackageBuilder::new();
    front.export("FrontObj", SymbolIndex::null(), payload(&[], b"front"));
    front.write(dir.path(), "front");

    let (mut manager, state) = make_manager(dir.path());
    manager.load_async("back", None, LoadPriority::NORMAL, |_| {});
    manager.load_async("front", None, LoadPriority::NORMAL, |_| {});
    // Duplicate request: merges into the in-flight load and raises it
    manager.load_async("front", None, LoadPriority::HIGH, |_| {});

    // Let both headers land without starting any symbol work, so the ready
    // queue holds both packages when execution begins
    let zero = TickBudget::with_limit(Duration::ZERO);
    for _ in 0..50 {
        manager.update(&zero);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(state.lock().unwrap().allocated.is_empty());

    assert!(manager.flush_all());
    let state = state.lock().unwrap();
    let events = &state.events;
    let front_at = events.iter().position(|e| e == "alloc FrontObj").unwrap();
    let back_at = events.iter().position(|e| e == "alloc BackObj").unwrap();
    assert!(
        front_at < back_at,
        "merged high-priority load was not scheduled first: {:?}",
        events
    );
}

#[test]
fn load_percentage_reflects_progress() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pkg = PackageBuilder::new();
    pkg.export("P", SymbolIndex::null(), payload(&[], b"p"));
    pkg.write(dir.path(), "tracked");

    let (mut manager, _state) = make_manager(dir.path());
    assert_eq!(manager.load_percentage("tracked"), None);

    let request = manager.load_async("tracked", None, LoadPriority::NORMAL, |_| {});
    let zero = TickBudget::with_limit(Duration::ZERO);
    for _ in 0..20 {
        manager.update(&zero);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(manager.load_percentage("tracked"), Some(0.0));

    assert!(manager.flush(request));
    // Completed and released; no longer tracked
    assert_eq!(manager.load_percentage("tracked"), None);
}
