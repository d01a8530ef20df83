use facecheck_core::types::ENCODING_DIM;
use facecheck_core::{
    CaptureContext, Config, Encoding, EncodingCache, EncodingStore, ProbeImage, RecognitionError,
    RecognitionService, SqliteStore,
};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn portrait(seed: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(64, 64, |x, y| {
        let r = (120 + (x * seed + y) % 120) as u8;
        let g = (80 + (y * 3 + seed) % 90) as u8;
        Rgb([r, g, ((x ^ y) % 70) as u8])
    });
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
    buf.into_inner()
}

fn service(dir: &TempDir) -> (RecognitionService, Arc<SqliteStore>) {
    let config = Config {
        db_path: dir.path().join("facecheck.db"),
        workers: 3,
        ..Config::default()
    };
    let store = Arc::new(SqliteStore::open(&config.db_path).unwrap());
    let service = RecognitionService::with_sqlite(&config, Arc::clone(&store)).unwrap();
    (service, store)
}

#[tokio::test]
async fn test_enroll_recognize_and_record_attendance() {
    let dir = TempDir::new().unwrap();
    let (service, store) = service(&dir);

    let ada = store.add_person("Ada").unwrap();
    let alan = store.add_person("Alan").unwrap();
    let ada_record = store.add_record(ada, &[portrait(3), portrait(3)]).unwrap();
    store.add_record(alan, &[portrait(17)]).unwrap();

    let report = service.regenerate(None).await.unwrap();
    assert_eq!((report.total, report.success, report.failed), (2, 2, 0));

    let hit = service
        .recognize_one(portrait(3), CaptureContext { service_id: Some(9) })
        .await
        .unwrap();
    assert_eq!(hit.record_id, ada_record);
    assert_eq!(hit.display_name, "Ada");

    let rows = store.list_attendance(Some(ada)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].service_id, Some(9));
}

#[tokio::test]
async fn test_batch_with_one_unparseable_image() {
    let dir = TempDir::new().unwrap();
    let (service, store) = service(&dir);
    let person = store.add_person("Ada").unwrap();
    store.add_record(person, &[portrait(5)]).unwrap();
    service.regenerate(None).await.unwrap();

    let images = (0..5)
        .map(|i| ProbeImage {
            filename: format!("probe-{i}.jpg"),
            bytes: if i == 2 { b"GIF89a-truncated".to_vec() } else { portrait(5) },
        })
        .collect();
    let report = service.recognize_batch(images, CaptureContext::default()).await.unwrap();

    assert_eq!(report.total_images, 5);
    assert_eq!(report.results.len(), 5);
    for (i, item) in report.results.iter().enumerate() {
        assert_eq!(item.index, i);
        assert_eq!(item.filename, format!("probe-{i}.jpg"));
        assert_eq!(item.success, i != 2, "item {i}");
    }
    assert!(report.results[2].error.is_some());
    assert_eq!((report.processed, report.failed), (4, 1));
}

#[tokio::test]
async fn test_corrupt_encoding_skipped_by_cache() {
    let dir = TempDir::new().unwrap();
    let (_service, store) = service(&dir);
    let person = store.add_person("Ada").unwrap();
    for i in 0..3 {
        let id = store.add_record(person, &[vec![0]]).unwrap();
        let enc = Encoding::new(vec![i as f32; ENCODING_DIM]).unwrap();
        store.save_encoding(id, &enc.to_bytes()).unwrap();
    }
    let corrupt = store.add_record(person, &[vec![0]]).unwrap();
    store.save_encoding(corrupt, b"\x80\x04\x95pickled").unwrap();

    let cache = EncodingCache::new(store, Duration::from_secs(60));
    let gallery = cache.load().unwrap();
    assert_eq!(gallery.len(), 3);
    assert!(!gallery.contains_key(&corrupt));
}

#[tokio::test]
async fn test_unknown_person_is_not_matched() {
    let dir = TempDir::new().unwrap();
    let (service, store) = service(&dir);
    let person = store.add_person("Ada").unwrap();
    store.add_record(person, &[portrait(3)]).unwrap();
    service.regenerate(None).await.unwrap();

    let blank = {
        let img = RgbImage::from_pixel(64, 64, Rgb([250, 250, 250]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    };
    let err = service.recognize_one(blank, CaptureContext::default()).await.unwrap_err();
    assert!(matches!(err, RecognitionError::NoConfidentMatch { .. }));
    assert!(store.list_attendance(None).unwrap().is_empty());
}
