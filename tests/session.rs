use egui::{Pos2, Rect, Vec2};
use image::Rgba;
use uuid::Uuid;

use retouchfe::canvas::RasterImage;
use retouchfe::error::{EditError, ErrorCategory};
use retouchfe::ops::ai::{EditRequest, EditTarget, GenerateError};
use retouchfe::ops::transform::CropRegion;
use retouchfe::project::{Project, SessionCommand, ToolKind};
use retouchfe::settings::EngineSettings;
use retouchfe::store::{FileSessionStore, MemorySessionStore, SessionStore};
use retouchfe::viewport::ViewportLayout;

fn gradient(w: u32, h: u32) -> RasterImage {
    RasterImage::new(image::RgbaImage::from_fn(w, h, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    }))
}

fn memory_project() -> (Project, MemorySessionStore) {
    let store = MemorySessionStore::new();
    let project = Project::new("session", Box::new(store.clone()), EngineSettings::default());
    (project, store)
}

#[test]
fn crop_undo_and_branching() {
    let (mut p, _) = memory_project();
    let original = gradient(800, 600);
    p.load_image(original.clone(), "Original").expect("load");

    p.apply(SessionCommand::SetCropRegion(Some(CropRegion::new(100.0, 100.0, 400.0, 300.0))))
        .expect("region");
    p.apply_crop().expect("crop");
    let cropped = p.current().cloned().expect("current");
    assert_eq!(cropped.dimensions(), (400, 300));
    assert_eq!(cropped.get_pixel(0, 0), original.get_pixel(100, 100));

    p.apply(SessionCommand::Undo).expect("undo");
    assert_eq!(p.current(), Some(&original));
    assert!(p.history.can_redo());

    p.flip(true).expect("flip");
    assert!(!p.history.can_redo());
    assert_eq!(p.history.labels(), vec!["Original", "Flip horizontal"]);
}

#[test]
fn commit_after_undo_truncates_store_too() {
    let (mut p, store) = memory_project();
    p.load_image(gradient(16, 16), "Original").expect("load");
    for _ in 0..4 {
        p.rotate_quarter(1).expect("rotate");
    }
    assert_eq!(p.history.len(), 5);

    for _ in 0..3 {
        p.apply(SessionCommand::Undo).expect("undo");
    }
    p.flip(false).expect("flip");

    // 5 entries, 3 undos, 1 commit → 5 − 3 + 1
    assert_eq!(p.history.len(), 3);
    assert_eq!(p.history.pointer(), 2);
    assert_eq!(store.indices(), vec![0, 1, 2]);
}

#[test]
fn file_session_round_trip_and_corruption() {
    let dir = tempfile::tempdir().expect("tempdir");
    let id = Uuid::new_v4();
    let mut settings = EngineSettings::default();
    settings.store_root = Some(dir.path().to_path_buf());

    {
        let mut p = Project::open_file_session(id, "photo", settings.clone()).expect("open");
        p.load_image(gradient(20, 10), "Original").expect("load");
        p.rotate_quarter(1).expect("rotate");
        p.flip(true).expect("flip");
        p.apply(SessionCommand::Undo).expect("undo");
        p.apply(SessionCommand::SelectTool(ToolKind::Crop)).expect("tool");
    }

    let mut restored = Project::open_file_session(id, "photo", settings.clone()).expect("reopen");
    assert!(restored.restore_session().expect("restore"));
    assert_eq!(restored.history.len(), 3);
    assert_eq!(restored.history.pointer(), 1);
    assert_eq!(restored.active_tool(), ToolKind::Crop);
    assert_eq!(restored.current().map(|r| r.dimensions()), Some((10, 20)));
    drop(restored);

    // Lose one entry on disk: the whole session is discarded.
    let session_dir = dir.path().join(id.to_string());
    std::fs::remove_file(session_dir.join("entry_00001.bin")).expect("remove entry");
    let mut broken = Project::open_file_session(id, "photo", settings).expect("reopen");
    let err = broken.restore_session().expect_err("corrupt");
    assert!(matches!(err, EditError::CorruptSession { expected: 3, found: 2 }));
    assert_eq!(err.category(), ErrorCategory::Corruption);
    assert!(broken.history.is_empty());

    let store = FileSessionStore::open_dir(session_dir).expect("store");
    assert!(store.load_descriptor().expect("descriptor").is_none());
}

#[test]
fn remote_edit_round_trip_with_closure_generator() {
    let (mut p, _) = memory_project();
    p.load_image(gradient(64, 48), "Original").expect("load");
    let layout = ViewportLayout::new(Rect::from_min_size(Pos2::ZERO, Vec2::new(128.0, 96.0)), 64, 48);
    p.apply(SessionCommand::SetLayout {
        layout,
        device_pixel_ratio: 1.0,
    })
    .expect("layout");

    // Screen (20, 40) on a 2× fitted image → natural (10, 20).
    p.apply(SessionCommand::PointerDown {
        pos: Pos2::new(20.0, 40.0),
        target: retouchfe::project::PointerTarget::Image,
    })
    .expect("down");
    p.apply(SessionCommand::PointerUp { pos: Pos2::new(20.0, 40.0) }).expect("up");

    let generator = |req: &EditRequest| -> Result<RasterImage, GenerateError> {
        match req.target {
            EditTarget::Hotspot(point) if point == Pos2::new(10.0, 20.0) => {
                Ok(RasterImage::filled(req.image.width(), req.image.height(), Rgba([0, 0, 0, 255])))
            }
            _ => Err(GenerateError::Other("unexpected target".into())),
        }
    };
    let pending = p.begin_remote_edit("darken").expect("begin");
    p.run_remote_edit(pending, &generator).expect("run");
    assert_eq!(p.history.len(), 2);
    assert_eq!(p.current().map(|r| r.get_pixel(5, 5)), Some(Rgba([0, 0, 0, 255])));
    assert!(!p.is_busy());
}

#[test]
fn failures_leave_history_untouched() {
    let (mut p, store) = memory_project();
    assert!(matches!(p.apply_crop(), Err(EditError::NoImage)));

    p.load_image(gradient(8, 8), "Original").expect("load");
    p.tools.hotspot = Some(retouchfe::project::Hotspot {
        natural: Pos2::new(1.0, 1.0),
        display: Pos2::new(1.0, 1.0),
    });
    let pending = p.begin_remote_edit("x").expect("begin");
    assert!(matches!(p.apply(SessionCommand::Redo), Err(EditError::Busy)));
    let failing = |_: &EditRequest| -> Result<RasterImage, GenerateError> { Err(GenerateError::Blocked("safety".into())) };
    let err = p.run_remote_edit(pending, &failing).expect_err("blocked");
    assert_eq!(err.category(), ErrorCategory::Collaborator);
    assert_eq!(p.history.len(), 1);

    store.fail_writes(Some(retouchfe::store::InjectedFailure::Unavailable));
    let err = p.rotate_quarter(2).expect_err("unavailable");
    assert_eq!(err.category(), ErrorCategory::Persistence);
    assert_eq!(p.history.len(), 1);
    assert_eq!(store.indices(), vec![0]);
}
