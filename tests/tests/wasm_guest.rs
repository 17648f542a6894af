use futures::StreamExt;
use futures::future::join_all;
use ocrbridge::guest::{GuestRuntime, RuntimeConfig};
use ocrbridge::{
    EngineCell, EngineConfig, EngineHandle, GuestLoader, LifecycleState, ModelBundle,
    ModuleSource, OcrError, OcrResult, ProgressCallback, RegionAllocator, SessionCorrelator,
    StageKind, WasmGuest, WasmtimeLoader,
};
use ocrbridge_testing::wat::{self, OCR_GUEST_WAT, RECOGNIZED_TEXT};
use ocrbridge_testing::init_tracing;
use parking_lot::Mutex;
use std::sync::Arc;

const PAGE: u32 = 65536;

/// Allocator that grows linear memory for every reservation
const GROWING_GUEST_WAT: &str = r#"
(module
    (memory (export "memory") 1)
    (data (i32.const 16) "g1\00")
    (func (export "alloc") (param $n i32) (result i32)
        (local $p i32)
        (local.set $p (i32.mul (memory.size) (i32.const 65536)))
        (if (i32.eq
                (memory.grow (i32.div_u (i32.add (local.get $n) (i32.const 65535)) (i32.const 65536)))
                (i32.const -1))
            (then (return (i32.const 0))))
        (local.get $p))
    (func (export "dealloc") (param i32 i32))
    (func (export "retto_init") (param i32 i32 i32 i32 i32 i32 i32 i32))
    (func (export "retto_rec") (param i32 i32) (result i32)
        (i32.const 16))
)
"#;

/// Recognition walks every input byte before notifying, so its cost grows
/// with the input
const SCANNING_GUEST_WAT: &str = r#"
(module
    (import "env" "retto_notify_det_done" (func $det (param i32 i32)))
    (import "env" "retto_notify_cls_done" (func $cls (param i32 i32)))
    (import "env" "retto_notify_rec_done" (func $rec (param i32 i32)))
    (memory (export "memory") 1)
    (global $heap (mut i32) (i32.const 1024))
    (data (i32.const 16) "f1\00")
    (data (i32.const 32) "{\22items\22:[]}\00")
    (func (export "alloc") (param $n i32) (result i32)
        (local $p i32)
        (local.set $p (global.get $heap))
        (global.set $heap (i32.add (global.get $heap) (local.get $n)))
        (local.get $p))
    (func (export "dealloc") (param i32 i32))
    (func (export "retto_init") (param i32 i32 i32 i32 i32 i32 i32 i32))
    (func (export "retto_rec") (param $ptr i32) (param $len i32) (result i32)
        (local $i i32)
        (loop $scan
            (local.set $i (i32.add (local.get $i) (i32.const 1)))
            (br_if $scan (i32.lt_u (local.get $i) (local.get $len))))
        (call $det (i32.const 16) (i32.const 32))
        (call $cls (i32.const 16) (i32.const 32))
        (call $rec (i32.const 16) (i32.const 32))
        (i32.const 16))
)
"#;

/// Missing the `alloc` export
const NO_ALLOC_GUEST_WAT: &str = r#"
(module
    (memory (export "memory") 1)
    (func (export "dealloc") (param i32 i32))
    (func (export "retto_init") (param i32 i32 i32 i32 i32 i32 i32 i32))
    (func (export "retto_rec") (param i32 i32) (result i32)
        (i32.const 0))
)
"#;

fn wasm_engine(wat: &str, config: &EngineConfig) -> OcrResult<(EngineHandle, Arc<WasmGuest>)> {
    let runtime = GuestRuntime::new(config.runtime.clone())?;
    let module = runtime.compile("ocr-fixture", wat.as_bytes())?;
    let correlator = Arc::new(SessionCorrelator::new(
        config.session.max_unclaimed_notifications,
    ));
    let guest = Arc::new(WasmGuest::instantiate(
        &runtime,
        &module,
        config,
        Arc::clone(&correlator),
    )?);
    let engine = EngineHandle::new(guest.clone(), correlator, &config.session);
    Ok((engine, guest))
}

fn bundle() -> ModelBundle {
    ModelBundle::new(vec![1u8; 300], vec![2u8; 200], vec![3u8; 400], b"a\nb\n".to_vec()).unwrap()
}

#[tokio::test]
async fn test_external_weights_guest_end_to_end() {
    init_tracing();
    let (engine, guest) = wasm_engine(OCR_GUEST_WAT, &EngineConfig::default()).unwrap();

    assert!(matches!(engine.init(None).await, Err(OcrError::MissingModel)));
    assert_eq!(wat::init_mode(&guest).unwrap(), 0);

    let bundle = bundle();
    engine.init(Some(&bundle)).await.unwrap();
    assert_eq!(wat::init_mode(&guest).unwrap(), 1);
    assert_eq!(wat::weight_bytes(&guest).unwrap() as usize, bundle.total_bytes());
    assert_eq!(wat::live_regions(&guest).unwrap(), 0);

    let outcome = engine.recognize(b"\x89PNG fake image").await.unwrap();
    assert_eq!(outcome.texts().collect::<Vec<_>>(), vec![RECOGNIZED_TEXT]);
    assert_eq!(outcome.detection.items.len(), 1);
    assert_eq!(outcome.detection.items[0].bbox.width(), 56);
    assert_eq!(outcome.classification.items[0].label, 0);
    assert_eq!(wat::submissions(&guest).unwrap(), 1);
    assert_eq!(wat::live_regions(&guest).unwrap(), 0);
    assert_eq!(engine.pending_notifications(), 0);
}

#[tokio::test]
async fn test_stages_arrive_in_order_with_fresh_tokens() {
    let (engine, guest) = wasm_engine(OCR_GUEST_WAT, &EngineConfig::default()).unwrap();
    engine.init(Some(&bundle())).await.unwrap();

    for expected_token in ["s1", "s2", "s3"] {
        let mut stages = engine.submit(b"page").await.unwrap();
        assert_eq!(stages.get_ref().token().as_str(), expected_token);

        let mut kinds = Vec::new();
        while let Some(stage) = stages.next().await {
            kinds.push(stage.unwrap().kind());
        }
        assert_eq!(kinds, StageKind::ORDER.to_vec());
        assert_eq!(wat::live_regions(&guest).unwrap(), 0);
    }
}

#[tokio::test]
async fn test_embedded_weights_guest_ignores_bundle() {
    let (engine, guest) = wasm_engine(&wat::embedded_guest_wat(), &EngineConfig::default()).unwrap();

    engine.init(Some(&bundle())).await.unwrap();
    assert_eq!(wat::init_mode(&guest).unwrap(), 2);
    assert_eq!(wat::weight_bytes(&guest).unwrap(), 0);
    assert_eq!(wat::live_regions(&guest).unwrap(), 0);

    let outcome = engine.recognize(b"page").await.unwrap();
    assert_eq!(outcome.texts().count(), 1);
}

#[tokio::test]
async fn test_malformed_payload_from_guest() {
    let (engine, guest) = wasm_engine(OCR_GUEST_WAT, &EngineConfig::default()).unwrap();
    engine.init(Some(&bundle())).await.unwrap();

    let mut input = b"?page".to_vec();
    input[0] = wat::MALFORMED_TRIGGER;
    let mut stages = engine.submit(&input).await.unwrap();

    let first = stages.next().await.unwrap();
    assert!(matches!(
        first,
        Err(OcrError::MalformedNotification {
            stage: StageKind::Detection,
            ..
        })
    ));
    assert!(stages.next().await.is_none());
    assert_eq!(wat::live_regions(&guest).unwrap(), 0);
    assert_eq!(engine.pending_notifications(), 0);
}

#[tokio::test]
async fn test_refused_reservation() {
    let (engine, guest) = wasm_engine(OCR_GUEST_WAT, &EngineConfig::default()).unwrap();
    engine.init(Some(&bundle())).await.unwrap();

    let oversized = vec![0u8; wat::MAX_RESERVATION as usize + 1];
    let result = engine.submit(&oversized).await;
    assert!(matches!(
        result,
        Err(OcrError::Allocation { size }) if size == u64::from(wat::MAX_RESERVATION) + 1
    ));
    assert_eq!(wat::submissions(&guest).unwrap(), 0);
    assert_eq!(wat::live_regions(&guest).unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_imports_rejected_without_trap_stubs() {
    let mut config = EngineConfig::default();
    config.runtime = RuntimeConfig {
        trap_unknown_imports: false,
        ..RuntimeConfig::default()
    };

    let result = wasm_engine(OCR_GUEST_WAT, &config);
    assert!(matches!(result, Err(OcrError::ModuleLoad(_))));
}

#[tokio::test]
async fn test_wasmtime_loader_shares_one_guest() {
    let source = ModuleSource::Bytes(Arc::from(OCR_GUEST_WAT.as_bytes()));
    let config = EngineConfig::default();
    let session = config.session.clone();
    let cell = EngineCell::new(
        Arc::new(WasmtimeLoader::with_source(config, source)),
        session,
    );

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let progress: ProgressCallback = Arc::new(move |ratio| sink.lock().push(ratio));

    let first = cell.load(Some(progress));
    let rest = join_all((0..3).map(|_| cell.load(None)));
    let (first, rest) = futures::join!(first, rest);
    let engine = first.unwrap();
    for other in rest {
        assert_eq!(other.unwrap(), engine);
    }
    assert_eq!(*reports.lock(), vec![1.0]);

    engine.init(Some(&bundle())).await.unwrap();
    let outcome = engine.recognize(b"page").await.unwrap();
    assert_eq!(outcome.texts().collect::<Vec<_>>(), vec![RECOGNIZED_TEXT]);
}

#[tokio::test]
async fn test_missing_export_fails_the_load() {
    let source = ModuleSource::Bytes(Arc::from(NO_ALLOC_GUEST_WAT.as_bytes()));
    let loader = WasmtimeLoader::with_source(EngineConfig::default(), source.clone());

    let result = loader
        .load(Arc::new(SessionCorrelator::default()), None)
        .await;
    match result {
        Err(err @ OcrError::ModuleLoad(_)) => {
            assert!(err.to_string().contains("alloc"));
            assert!(err.is_global());
        }
        Err(other) => panic!("expected a module load error, got {:?}", other),
        Ok(_) => panic!("a guest without alloc must not load"),
    }

    let config = EngineConfig::default();
    let session = config.session.clone();
    let cell = EngineCell::new(Arc::new(WasmtimeLoader::with_source(config, source)), session);
    assert!(matches!(cell.load(None).await, Err(OcrError::ModuleLoad(_))));
    assert_eq!(cell.state(), LifecycleState::Unloaded);
}

#[tokio::test]
async fn test_memory_growth_is_capped() {
    let mut config = EngineConfig::default();
    config.runtime = RuntimeConfig::default().with_max_memory_pages(4);
    let (_engine, guest) = wasm_engine(GROWING_GUEST_WAT, &config).unwrap();

    let first = guest.reserve(2 * PAGE).unwrap();
    assert_eq!(first.0, PAGE);
    assert_eq!(guest.memory_size(), 3 * PAGE as usize);

    // would need five pages
    assert!(matches!(
        guest.reserve(2 * PAGE),
        Err(OcrError::Allocation { size }) if size == u64::from(2 * PAGE)
    ));
    assert_eq!(guest.memory_size(), 3 * PAGE as usize);

    // the same request fits under the default cap
    let (_engine, roomy) = wasm_engine(GROWING_GUEST_WAT, &EngineConfig::default()).unwrap();
    roomy.reserve(2 * PAGE).unwrap();
    roomy.reserve(2 * PAGE).unwrap();
    assert_eq!(roomy.memory_size(), 5 * PAGE as usize);
}

#[tokio::test]
async fn test_fuel_is_refilled_per_call() {
    let mut config = EngineConfig::default();
    config.runtime = RuntimeConfig::default().with_fuel(20_000);
    let (engine, _guest) = wasm_engine(SCANNING_GUEST_WAT, &config).unwrap();
    engine.init(Some(&bundle())).await.unwrap();

    // each scan costs a sizeable share of the budget; together they exceed it
    for _ in 0..5 {
        let outcome = engine.recognize(&[1u8; 1000]).await.unwrap();
        assert!(outcome.recognition.items.is_empty());
    }

    let exhausted = engine.submit(&vec![1u8; 20_000]).await;
    assert!(matches!(exhausted, Err(OcrError::Execution(_))));
    assert_eq!(engine.pending_notifications(), 0);

    // the next call starts with a full budget again
    engine.recognize(&[1u8; 1000]).await.unwrap();
}

#[tokio::test]
async fn test_oversized_payload_is_malformed() {
    let mut config = EngineConfig::default();
    config.session.max_payload_len = 16;
    let (engine, guest) = wasm_engine(OCR_GUEST_WAT, &config).unwrap();
    engine.init(Some(&bundle())).await.unwrap();

    let mut stages = engine.submit(b"page").await.unwrap();
    match stages.next().await {
        Some(Err(OcrError::MalformedNotification { token, stage, reason })) => {
            assert_eq!(token, "s1");
            assert_eq!(stage, StageKind::Detection);
            assert!(reason.contains("16 bytes"));
        }
        other => panic!("expected a malformed detection, got {:?}", other),
    }
    assert!(stages.next().await.is_none());
    assert_eq!(wat::live_regions(&guest).unwrap(), 0);
    assert_eq!(engine.pending_notifications(), 0);
}

#[tokio::test]
async fn test_concurrent_init_runs_guest_init_once() {
    let (engine, guest) = wasm_engine(OCR_GUEST_WAT, &EngineConfig::default()).unwrap();
    let bundle = bundle();

    let results = join_all((0..4).map(|_| engine.init(Some(&bundle)))).await;
    assert!(results.iter().all(Result::is_ok));
    assert!(engine.is_initialized().await);
    assert_eq!(wat::init_calls(&guest).unwrap(), 1);
    assert_eq!(wat::live_regions(&guest).unwrap(), 0);
}
