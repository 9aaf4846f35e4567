//! End-to-end tests against the real `pdfium-pool-worker` binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use pdfium_pool::native::sample_document;
use pdfium_pool::requests::*;
use pdfium_pool::{
    BackendKind, FormFillCallbacks, Handle, HandleKind, LibraryKind, LibrarySettings, LocalTime,
    PdfiumService, PoolConfig, PoolError, RenderArea, RestartPolicy, SearchFlags, WorkerId,
    WorkerState,
};

fn subprocess_config(size: usize) -> PoolConfig {
    let mut config = PoolConfig {
        backend: BackendKind::Subprocess,
        size,
        library: LibrarySettings {
            kind: LibraryKind::Memory,
            path: None,
        },
        restart: RestartPolicy {
            enabled: true,
            max_restarts: 3,
            backoff_ms: 0,
        },
        ..PoolConfig::default()
    };
    config.subprocess.program = Some(PathBuf::from(env!("CARGO_BIN_EXE_pdfium-pool-worker")));
    config
}

async fn load(service: &PdfiumService, pages: &[&str]) -> Handle {
    service
        .load_document(LoadDocument {
            data: sample_document(pages, None),
            ..LoadDocument::default()
        })
        .await
        .unwrap()
        .document
}

#[tokio::test]
async fn test_documents_across_worker_processes() {
    let service = PdfiumService::start(subprocess_config(2)).await.unwrap();
    let first = load(&service, &["alpha", "beta", "gamma"]).await;
    let second = load(&service, &["needle in a haystack"]).await;

    assert_eq!(
        service
            .get_page_count(GetPageCount { document: first })
            .await
            .unwrap()
            .count,
        3
    );

    let text_page = service
        .load_text_page(LoadTextPage {
            page: Page::index(second, 0),
        })
        .await
        .unwrap()
        .text_page;
    let search = service
        .find_start(FindStart {
            text_page,
            query: "NEEDLE".to_string(),
            flags: SearchFlags::default(),
            start_index: 0,
        })
        .await
        .unwrap()
        .search;
    assert!(service.find_next(FindNext { search }).await.unwrap().found);

    let stats = service.stats();
    assert_eq!(stats.sessions, 2);
    assert!(stats.workers.iter().all(|w| w.sessions == 1));

    service
        .close_document(CloseDocument { document: second })
        .await
        .unwrap();
    assert_eq!(
        service.find_next(FindNext { search }).await.unwrap_err(),
        PoolError::HandleNotFound {
            kind: HandleKind::Search
        }
    );
    service.shutdown().await;
}

#[tokio::test]
async fn test_form_callbacks_cross_the_process_boundary() {
    let service = PdfiumService::start(subprocess_config(1)).await.unwrap();
    let document = load(&service, &["cover", "form page"]).await;

    let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let loaded: Arc<Mutex<Option<Handle>>> = Arc::default();
    let callbacks = {
        let (on_invalidate, on_timer, on_kill) =
            (Arc::clone(&seen), Arc::clone(&seen), Arc::clone(&seen));
        let loaded = Arc::clone(&loaded);
        FormFillCallbacks::new()
            .on_invalidate(move |_, page, rect| {
                assert_eq!(page.kind(), HandleKind::Page);
                assert_eq!(rect.top, 792.0);
                on_invalidate.lock().push("invalidate");
            })
            .on_set_cursor(|_, _| {})
            .on_set_timer(move |_, _| {
                on_timer.lock().push("set_timer");
                42
            })
            .on_kill_timer(move |_, timer| {
                assert_eq!(timer, 42);
                on_kill.lock().push("kill_timer");
            })
            .on_get_local_time(|_| LocalTime::default())
            .on_get_page(|_, _, _| Ok(None))
            .on_get_current_page(move |scope, document| {
                // Runs while the worker process is still inside the outer call
                let page = scope.load_page(document, 1)?;
                *loaded.lock() = Some(page);
                Ok(Some(page))
            })
            .on_get_rotation(|_, _| 0)
            .on_execute_named_action(|_, _| {})
    };

    let form = service
        .init_form_fill_environment(InitFormFillEnvironment {
            document,
            callbacks,
        })
        .await
        .unwrap()
        .form;
    service
        .form_on_after_load_page(FormOnAfterLoadPage {
            form,
            page: Page::index(document, 0),
        })
        .await
        .unwrap();

    let page = loaded.lock().take().unwrap();
    service.close_page(ClosePage { page }).await.unwrap();

    service
        .exit_form_fill_environment(ExitFormFillEnvironment { form })
        .await
        .unwrap();
    assert_eq!(*seen.lock(), vec!["invalidate", "set_timer", "kill_timer"]);
    service.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_worker_is_replaced() {
    let mut config = subprocess_config(2);
    config.call_timeout_ms = Some(200);
    let service = PdfiumService::start(config).await.unwrap();

    let stuck = load(&service, &["slow"]).await;
    let healthy = load(&service, &["fine", "also fine"]).await;
    let bitmap = service
        .create_bitmap(CreateBitmap {
            width: 10,
            height: 10,
            alpha: false,
            document: Some(stuck),
        })
        .await
        .unwrap()
        .bitmap;

    // The pause check hangs past the deadline; the worker process is killed
    let err = service
        .render_page_bitmap_start(RenderPageBitmapStart {
            bitmap,
            page: Page::index(stuck, 0),
            area: RenderArea {
                start_x: 0,
                start_y: 0,
                size_x: 10,
                size_y: 10,
                rotate: 0,
                flags: 0,
            },
            pause: Some(Arc::new(|| {
                std::thread::sleep(Duration::from_millis(800));
                false
            })),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Timeout { .. }), "{:?}", err);
    assert!(err.is_worker_fatal());

    assert_eq!(
        service
            .get_page_count(GetPageCount { document: stuck })
            .await
            .unwrap_err(),
        PoolError::HandleNotFound {
            kind: HandleKind::Document
        }
    );
    assert_eq!(
        service
            .get_page_count(GetPageCount { document: healthy })
            .await
            .unwrap()
            .count,
        2
    );

    let mut restarted = false;
    for _ in 0..50 {
        let stats = service.stats();
        if stats
            .workers
            .iter()
            .any(|w| w.restarts == 1 && w.generation == 1 && w.state == WorkerState::Ready)
        {
            restarted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(restarted, "worker was not restarted: {:?}", service.stats());

    let fresh = load(&service, &["after restart"]).await;
    assert_eq!(
        service
            .get_page_count(GetPageCount { document: fresh })
            .await
            .unwrap()
            .count,
        1
    );
    service.shutdown().await;
}

#[tokio::test]
async fn test_path_loads_in_the_worker_process() {
    use std::io::Write;

    let service = PdfiumService::start(subprocess_config(1)).await.unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&sample_document(&["on disk", "two"], None))
        .unwrap();

    let document = service
        .load_document_from_path(LoadDocumentFromPath {
            path: file.path().to_path_buf(),
            ..LoadDocumentFromPath::default()
        })
        .await
        .unwrap()
        .document;
    assert_eq!(
        service
            .get_page_count(GetPageCount { document })
            .await
            .unwrap()
            .count,
        2
    );
    service.shutdown().await;
}

const SMALL_AREA: RenderArea = RenderArea {
    start_x: 0,
    start_y: 0,
    size_x: 10,
    size_y: 10,
    rotate: 0,
    flags: 0,
};

fn worker_of(service: &PdfiumService, document: Handle) -> WorkerId {
    service
        .pool()
        .registry()
        .resolve(document, HandleKind::Document, None)
        .unwrap()
        .worker
}

async fn bitmap_for(service: &PdfiumService, document: Handle) -> Handle {
    service
        .create_bitmap(CreateBitmap {
            width: 10,
            height: 10,
            alpha: false,
            document: Some(document),
        })
        .await
        .unwrap()
        .bitmap
}

#[cfg(unix)]
#[tokio::test]
async fn test_killed_worker_process_fails_only_its_documents() {
    let service = PdfiumService::start(subprocess_config(2)).await.unwrap();
    let doomed = load(&service, &["doomed"]).await;
    let survivor = load(&service, &["survivor", "two"]).await;
    let crashed = worker_of(&service, doomed);
    assert_ne!(crashed, worker_of(&service, survivor));

    let page = service
        .load_page(LoadPage {
            document: doomed,
            index: 0,
        })
        .await
        .unwrap()
        .page;
    let bitmap = bitmap_for(&service, doomed).await;
    let pid = service.stats().workers[crashed.index()].pid.unwrap();

    // The worker process dies while the call is waiting on a callback
    let err = service
        .render_page_bitmap_start(RenderPageBitmapStart {
            bitmap,
            page: Page::reference(page),
            area: SMALL_AREA,
            pause: Some(Arc::new(move || {
                let status = std::process::Command::new("kill")
                    .arg("-9")
                    .arg(pid.to_string())
                    .status()
                    .unwrap();
                assert!(status.success());
                std::thread::sleep(Duration::from_millis(100));
                false
            })),
        })
        .await
        .unwrap_err();
    assert!(
        matches!(err, PoolError::WorkerCrashed { worker, .. } if worker == crashed),
        "{:?}",
        err
    );

    for (handle, kind) in [
        (doomed, HandleKind::Document),
        (page, HandleKind::Page),
        (bitmap, HandleKind::Bitmap),
    ] {
        assert_eq!(
            service.pool().registry().resolve(handle, kind, None).unwrap_err(),
            PoolError::HandleNotFound { kind }
        );
    }
    assert_eq!(
        service
            .get_page_count(GetPageCount { document: survivor })
            .await
            .unwrap()
            .count,
        2
    );

    let mut restarted = None;
    for _ in 0..50 {
        let worker = &service.stats().workers[crashed.index()];
        if worker.state == WorkerState::Ready && worker.restarts == 1 {
            restarted = worker.pid;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(restarted.is_some_and(|fresh| fresh != pid), "{:?}", service.stats());

    let fresh = load(&service, &["after kill"]).await;
    assert_eq!(worker_of(&service, fresh), crashed);
    service.shutdown().await;
}

#[tokio::test]
async fn test_each_worker_runs_one_call_at_a_time() {
    let mut config = subprocess_config(2);
    config.sessions_per_worker = 2;
    let service = PdfiumService::start(config).await.unwrap();

    let active: Arc<[AtomicUsize; 2]> = Arc::default();
    let peak: Arc<[AtomicUsize; 2]> = Arc::default();
    let mut renders = Vec::new();
    for n in 0..4 {
        let name = format!("document {}", n);
        let document = load(&service, &[name.as_str()]).await;
        let worker = worker_of(&service, document).index();
        let bitmap = bitmap_for(&service, document).await;

        let pause: pdfium_pool::PauseCallback = {
            let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
            Arc::new(move || {
                let now = active[worker].fetch_add(1, Ordering::SeqCst) + 1;
                peak[worker].fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                active[worker].fetch_sub(1, Ordering::SeqCst);
                false
            })
        };
        let service = service.clone();
        renders.push(tokio::spawn(async move {
            service
                .render_page_bitmap_start(RenderPageBitmapStart {
                    bitmap,
                    page: Page::index(document, 0),
                    area: SMALL_AREA,
                    pause: Some(pause),
                })
                .await
        }));
    }

    for render in renders {
        render.await.unwrap().unwrap();
    }
    for worker in 0..2 {
        assert_eq!(peak[worker].load(Ordering::SeqCst), 1, "worker {}", worker);
    }
    assert!(service.stats().workers.iter().all(|w| w.sessions == 2));
    service.shutdown().await;
}

#[tokio::test]
async fn test_twice_as_many_loads_as_workers_all_complete() {
    let service = PdfiumService::start(subprocess_config(2)).await.unwrap();

    let mut tasks = Vec::new();
    for n in 0..4 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            let document = service
                .load_document(LoadDocument {
                    data: sample_document(&[format!("page {}", n).as_str(), "second"], None),
                    acquire_timeout: Some(Duration::from_secs(10)),
                    ..LoadDocument::default()
                })
                .await?
                .document;
            let count = service
                .get_page_count(GetPageCount { document })
                .await?
                .count;
            tokio::time::sleep(Duration::from_millis(50)).await;
            service.close_document(CloseDocument { document }).await?;
            Ok::<_, PoolError>(count)
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 2);
    }
    let stats = service.stats();
    assert_eq!(stats.sessions, 0);
    assert_eq!(stats.available_slots, 2);
    service.shutdown().await;
}
