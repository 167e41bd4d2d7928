//! Integration tests for the extraction pipeline.
//!
//! Every test runs offline: model candidates are scripted [`VisionModel`]s,
//! receipts are PNGs generated in memory, and multi-page documents are fed
//! through the page-stream seam so no pdfium library is needed. Spreadsheets
//! are read back with calamine.
//!
//! Run with:
//!   cargo test --test pipeline

use async_trait::async_trait;
use calamine::{Data, Reader, Xlsx};
use edgequake_receipts::{
    extract, extract_documents, extract_to_file, process_pages, ColumnSet, Credential,
    Diagnostic, ExtractionConfig, ExtractionContext, ExtractionError, ExtractionProgressCallback,
    ImageData, MediaKind, ModelError, PageImage, PageStream, ReceiptError, SourceDocument,
    VisionModel,
};
use futures::stream;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// A model candidate that answers from a fixed script, one entry per call.
/// Once the script runs out every call fails.
struct ScriptedModel {
    name: String,
    script: Mutex<VecDeque<Result<String, ModelError>>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn new(name: &str, script: Vec<Result<String, ModelError>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Always answers with `reply`.
    fn replying(name: &str, reply: &str, times: usize) -> Arc<Self> {
        Self::new(name, vec![Ok(reply.to_string()); times])
    }

    /// Always fails with a quota error.
    fn exhausted(name: &str) -> Arc<Self> {
        Self::new(name, Vec::new())
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &str, image: &ImageData) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(!prompt.is_empty(), "prompt must be sent with every page");
        assert_eq!(image.mime_type, "image/png");
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ModelError::Quota {
                    model: self.name.clone(),
                    retry_after_secs: None,
                })
            })
    }
}

const BAKERY: &str = r#"```json
{
  "date": "2024-03-01",
  "merchant": "Boulangerie Paul",
  "currency": "€",
  "category": "Restaurant",
  "items": [
    {"description": "Croissant", "quantity": 2, "price": 2.4},
    {"description": "Espresso", "quantity": 1, "price": 1.8}
  ]
}
```"#;

const TAXI: &str = r#"{"date":"2024-03-02","merchant":"G7","currency":"€","category":"Transport","items":[]}"#;

fn credential() -> Credential {
    Credential::new("test-key")
}

fn png_bytes() -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([250, 250, 250, 255])));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode png");
    buf
}

fn png_doc(name: &str) -> SourceDocument {
    SourceDocument::new(name, MediaKind::Image(ImageFormat::Png), png_bytes())
}

fn config_with(candidates: &[Arc<ScriptedModel>]) -> ExtractionConfig {
    candidates
        .iter()
        .fold(ExtractionConfig::builder(), |b, c| {
            b.candidate(c.clone() as Arc<dyn VisionModel>)
        })
        .build()
        .expect("valid config")
}

fn page_stream(pages: usize) -> PageStream {
    let items: Vec<Result<PageImage, ExtractionError>> = (1..=pages)
        .map(|page_num| {
            Ok(PageImage {
                page_num,
                image: DynamicImage::ImageRgba8(RgbaImage::new(4, 4)),
            })
        })
        .collect();
    Box::pin(stream::iter(items))
}

/// Read the single sheet of an xlsx artifact back as rows of cells.
fn read_sheet(bytes: &[u8]) -> Vec<Vec<Data>> {
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes.to_vec())).expect("valid xlsx");
    assert_eq!(workbook.sheet_names(), vec!["Expenses".to_string()]);
    let range = workbook.worksheet_range("Expenses").expect("sheet exists");
    range.rows().map(|r| r.to_vec()).collect()
}

fn text(s: &str) -> Data {
    Data::String(s.to_string())
}

// ── Single image ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn png_receipt_becomes_one_row_per_item() {
    let model = ScriptedModel::replying("primary", BAKERY, 1);
    let config = config_with(&[model.clone()]);

    let output = extract_documents(vec![png_doc("bakery.png")], &config, Some(&credential()))
        .await
        .expect("extraction succeeds");

    assert_eq!(model.calls(), 1);
    assert!(output.diagnostics.is_empty());
    assert_eq!(output.table.len(), 2);
    assert_eq!(output.stats.total_rows, 2);
    assert_eq!(output.stats.processed_pages, 1);
    assert_eq!(output.stats.model_attempts, 1);

    let rows = output.table.rows();
    assert_eq!(rows[0].description, "Croissant");
    assert_eq!(rows[0].quantity, 2.0);
    assert_eq!(rows[0].amount, 2.4);
    assert_eq!(rows[1].description, "Espresso");
    for row in rows {
        assert_eq!(row.date.as_deref(), Some("2024-03-01"));
        assert_eq!(row.merchant.as_deref(), Some("Boulangerie Paul"));
        assert_eq!(row.currency.as_deref(), Some("€"));
        assert_eq!(row.source_file, "bakery.png");
    }
}

#[tokio::test]
async fn spreadsheet_has_fixed_headers_and_typed_cells() {
    let model = ScriptedModel::replying("primary", BAKERY, 1);
    let config = config_with(&[model]);
    let output = extract_documents(vec![png_doc("bakery.png")], &config, Some(&credential()))
        .await
        .unwrap();

    let artifact = output.table.to_xlsx(&ColumnSet::new(true)).unwrap();
    assert_eq!(artifact.filename, "expenses.xlsx");
    assert_eq!(
        artifact.mime_type,
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
    );

    let sheet = read_sheet(&artifact.bytes);
    assert_eq!(sheet.len(), 3, "header + two rows");
    assert_eq!(
        sheet[0],
        vec![
            text("Date"),
            text("Merchant"),
            text("Category"),
            text("Description"),
            text("Quantity"),
            text("Amount"),
            text("Currency"),
            text("Source file"),
        ]
    );
    assert_eq!(
        sheet[1],
        vec![
            text("2024-03-01"),
            text("Boulangerie Paul"),
            text("Restaurant"),
            text("Croissant"),
            Data::Float(2.0),
            Data::Float(2.4),
            text("€"),
            text("bakery.png"),
        ]
    );
}

#[tokio::test]
async fn category_column_can_be_left_out() {
    let config = config_with(&[ScriptedModel::replying("primary", BAKERY, 1)]);
    let output = extract_documents(vec![png_doc("bakery.png")], &config, Some(&credential()))
        .await
        .unwrap();

    let sheet = read_sheet(&output.table.to_xlsx(&ColumnSet::new(false)).unwrap().bytes);
    assert_eq!(sheet[0].len(), 7);
    assert!(!sheet[0].contains(&text("Category")));
    assert_eq!(sheet[1][2], text("Croissant"));
}

#[tokio::test]
async fn receipt_without_items_yields_placeholder_row() {
    let config = ExtractionConfig::builder()
        .candidate(ScriptedModel::replying("primary", TAXI, 1) as Arc<dyn VisionModel>)
        .placeholder_label("Global expense")
        .build()
        .unwrap();

    let output = extract_documents(vec![png_doc("taxi.png")], &config, Some(&credential()))
        .await
        .unwrap();

    assert_eq!(output.table.len(), 1);
    let row = &output.table.rows()[0];
    assert_eq!(row.description, "Global expense");
    assert_eq!(row.quantity, 1.0);
    assert_eq!(row.amount, 0.0);
    assert_eq!(row.merchant.as_deref(), Some("G7"));
}

// ── Multi-page documents ─────────────────────────────────────────────────────

#[tokio::test]
async fn unparseable_second_page_keeps_first_page_rows() {
    let model = ScriptedModel::new(
        "primary",
        vec![
            Ok(BAKERY.to_string()),
            Ok("I'm sorry, this page is blank.".to_string()),
        ],
    );
    let config = config_with(&[model.clone()]);
    let ctx = ExtractionContext::new(&config, Some(&credential())).unwrap();

    let outcome = process_pages(&ctx, "statement.pdf", page_stream(2)).await;

    assert_eq!(model.calls(), 2);
    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.failed_pages, 1);
    assert_eq!(outcome.rows.len(), 2);
    assert!(outcome.rows.iter().all(|r| r.source_file == "statement.pdf"));

    assert_eq!(outcome.diagnostics.len(), 1);
    let d = &outcome.diagnostics[0];
    assert_eq!(d.filename, "statement.pdf");
    assert_eq!(d.page, Some(2));
    assert!(matches!(d.error, ExtractionError::Parse { .. }));
    assert!(d.to_string().contains("statement.pdf"));
}

#[tokio::test]
async fn render_failure_on_one_page_does_not_stop_the_next() {
    let model = ScriptedModel::replying("primary", TAXI, 2);
    let config = config_with(&[model.clone()]);
    let ctx = ExtractionContext::new(&config, Some(&credential())).unwrap();

    let items: Vec<Result<PageImage, ExtractionError>> = vec![
        Err(ExtractionError::Render {
            page: 1,
            detail: "bitmap allocation failed".into(),
        }),
        Ok(PageImage {
            page_num: 2,
            image: DynamicImage::ImageRgba8(RgbaImage::new(4, 4)),
        }),
    ];
    let outcome = process_pages(&ctx, "scan.pdf", Box::pin(stream::iter(items))).await;

    assert_eq!(model.calls(), 1);
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(outcome.diagnostics.len(), 1);
    assert_eq!(outcome.diagnostics[0].page, Some(1));
}

// ── Credentials and empty results ────────────────────────────────────────────

#[tokio::test]
async fn missing_credential_prevents_any_processing() {
    let model = ScriptedModel::replying("primary", BAKERY, 1);
    let config = config_with(&[model.clone()]);

    let err = extract_documents(vec![png_doc("bakery.png")], &config, None)
        .await
        .unwrap_err();

    assert!(matches!(err, ReceiptError::MissingCredential { .. }));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn zero_rows_is_nothing_extracted() {
    let model = ScriptedModel::replying("primary", "not json at all", 2);
    let config = config_with(&[model]);

    let err = extract_documents(
        vec![png_doc("a.png"), png_doc("b.png")],
        &config,
        Some(&credential()),
    )
    .await
    .unwrap_err();

    match err {
        ReceiptError::NothingExtracted { files, diagnostics } => {
            assert_eq!(files, 2);
            let names: Vec<_> = diagnostics.iter().map(|d| d.filename.as_str()).collect();
            assert_eq!(names, vec!["a.png", "b.png"]);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn nothing_extracted_writes_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("expenses.xlsx");
    let receipt = dir.path().join("blank.png");
    std::fs::write(&receipt, png_bytes()).unwrap();

    let config = config_with(&[ScriptedModel::replying("primary", "{{{", 1)]);
    let inputs = [receipt.to_string_lossy().to_string()];
    let result = extract_to_file(&inputs, &out, &config, Some(&credential())).await;

    assert!(matches!(result, Err(ReceiptError::NothingExtracted { .. })));
    assert!(!out.exists());
}

// ── Fallback chain ───────────────────────────────────────────────────────────

#[tokio::test]
async fn third_candidate_answers_after_two_failures() {
    let a = ScriptedModel::new(
        "model-a",
        vec![Err(ModelError::UnknownModel {
            model: "model-a".into(),
        })],
    );
    let b = ScriptedModel::exhausted("model-b");
    let c = ScriptedModel::replying("model-c", BAKERY, 1);
    let config = config_with(&[a.clone(), b.clone(), c.clone()]);

    let output = extract_documents(vec![png_doc("bakery.png")], &config, Some(&credential()))
        .await
        .unwrap();

    assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 1));
    assert_eq!(output.table.len(), 2);
    assert!(output.diagnostics.is_empty());
    assert_eq!(output.stats.model_attempts, 3);
}

#[tokio::test]
async fn first_success_skips_remaining_candidates() {
    let a = ScriptedModel::replying("model-a", BAKERY, 1);
    let b = ScriptedModel::replying("model-b", BAKERY, 1);
    let config = config_with(&[a.clone(), b.clone()]);

    extract_documents(vec![png_doc("bakery.png")], &config, Some(&credential()))
        .await
        .unwrap();

    assert_eq!((a.calls(), b.calls()), (1, 0));
}

#[tokio::test]
async fn exhausted_chain_reports_last_failure() {
    let a = ScriptedModel::exhausted("model-a");
    let b = ScriptedModel::new(
        "model-b",
        vec![Err(ModelError::Status {
            model: "model-b".into(),
            status: 503,
            body: "overloaded".into(),
        })],
    );
    let config = config_with(&[a.clone(), b.clone()]);
    let ctx = ExtractionContext::new(&config, Some(&credential())).unwrap();
    let outcome = process_pages(&ctx, "photo.png", page_stream(1)).await;

    assert!(outcome.rows.is_empty());
    assert_eq!(outcome.model_attempts, 2);
    assert_eq!(outcome.diagnostics.len(), 1);
    match &outcome.diagnostics[0].error {
        ExtractionError::Invocation { attempts, detail } => {
            assert_eq!(*attempts, 2);
            assert!(detail.contains("model-b"), "got: {detail}");
            assert!(detail.contains("503"), "got: {detail}");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

// ── Batch behaviour ──────────────────────────────────────────────────────────

#[tokio::test]
async fn corrupt_file_does_not_abort_the_batch() {
    let model = ScriptedModel::replying("primary", BAKERY, 1);
    let config = config_with(&[model.clone()]);
    let corrupt = SourceDocument::new(
        "torn.png",
        MediaKind::Image(ImageFormat::Png),
        b"\x89PNG\r\n\x1a\nnot really".to_vec(),
    );

    let output = extract_documents(
        vec![corrupt, png_doc("bakery.png")],
        &config,
        Some(&credential()),
    )
    .await
    .unwrap();

    assert_eq!(model.calls(), 1, "corrupt file never reaches the model");
    assert_eq!(output.table.len(), 2);
    assert_eq!(output.stats.failed_files, 1);
    assert_eq!(output.diagnostics.len(), 1);
    let d = &output.diagnostics[0];
    assert_eq!(d.filename, "torn.png");
    assert_eq!(d.page, None);
    assert!(matches!(d.error, ExtractionError::Decode { .. }));
}

#[tokio::test]
async fn rows_keep_file_then_item_order() {
    let model = ScriptedModel::new("primary", vec![Ok(TAXI.to_string()), Ok(BAKERY.to_string())]);
    let config = config_with(&[model]);

    let output = extract_documents(
        vec![png_doc("taxi.png"), png_doc("bakery.png")],
        &config,
        Some(&credential()),
    )
    .await
    .unwrap();

    let order: Vec<_> = output
        .table
        .iter()
        .map(|r| (r.source_file.as_str(), r.description.as_str()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("taxi.png", "Unspecified expense"),
            ("bakery.png", "Croissant"),
            ("bakery.png", "Espresso"),
        ]
    );
}

#[tokio::test]
async fn paid_only_filter_drops_zero_amounts() {
    let reply = r#"{"merchant":"Café","items":[
        {"description":"Coffee","price":2.5},
        {"description":"Free cookie","price":0},
        {"description":"Water"}
    ]}"#;
    let config = ExtractionConfig::builder()
        .candidate(ScriptedModel::replying("primary", reply, 1) as Arc<dyn VisionModel>)
        .paid_items_only(true)
        .build()
        .unwrap();

    let output = extract_documents(vec![png_doc("cafe.png")], &config, Some(&credential()))
        .await
        .unwrap();

    assert_eq!(output.table.len(), 1);
    assert_eq!(output.table.rows()[0].description, "Coffee");
}

#[tokio::test]
async fn local_paths_and_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let receipt = dir.path().join("lunch.png");
    std::fs::write(&receipt, png_bytes()).unwrap();
    let missing = dir.path().join("gone.jpg");

    let config = config_with(&[ScriptedModel::replying("primary", BAKERY, 1)]);
    let inputs = [
        missing.to_string_lossy().to_string(),
        receipt.to_string_lossy().to_string(),
    ];
    let output = extract(&inputs, &config, Some(&credential())).await.unwrap();

    assert_eq!(output.table.len(), 2);
    assert!(output.table.iter().all(|r| r.source_file == "lunch.png"));
    assert_eq!(output.diagnostics.len(), 1);
    assert_eq!(output.diagnostics[0].filename, "gone.jpg");
    assert!(matches!(
        output.diagnostics[0].error,
        ExtractionError::Input { .. }
    ));
}

#[tokio::test]
async fn extract_to_file_writes_readable_workbook() {
    let dir = tempfile::tempdir().unwrap();
    let receipt = dir.path().join("bakery.png");
    std::fs::write(&receipt, png_bytes()).unwrap();
    let out = dir.path().join("reports/march.xlsx");

    let config = config_with(&[ScriptedModel::replying("primary", BAKERY, 1)]);
    let inputs = [receipt.to_string_lossy().to_string()];
    let output = extract_to_file(&inputs, &out, &config, Some(&credential()))
        .await
        .unwrap();

    let sheet = read_sheet(&std::fs::read(&out).unwrap());
    assert_eq!(sheet.len(), output.table.len() + 1);
}

// ── Editing before export ────────────────────────────────────────────────────

#[tokio::test]
async fn edits_are_reflected_in_the_artifact() {
    let config = config_with(&[ScriptedModel::replying("primary", BAKERY, 1)]);
    let mut table = extract_documents(vec![png_doc("bakery.png")], &config, Some(&credential()))
        .await
        .unwrap()
        .table;

    table.remove(0);
    if let Some(row) = table.get_mut(0) {
        row.amount = 2.0;
        row.description = "Double espresso".into();
    }
    let mut extra = table.rows()[0].clone();
    extra.description = "Tip".into();
    extra.amount = 0.5;
    table.push(extra);

    let sheet = read_sheet(&table.to_xlsx(&ColumnSet::default()).unwrap().bytes);
    assert_eq!(sheet.len(), 3);
    assert_eq!(sheet[1][3], text("Double espresso"));
    assert_eq!(sheet[1][5], Data::Float(2.0));
    assert_eq!(sheet[2][3], text("Tip"));
}

// ── Progress events ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl ExtractionProgressCallback for Recorder {
    fn on_batch_start(&self, total_files: usize) {
        self.events.lock().unwrap().push(format!("batch {total_files}"));
    }

    fn on_file_start(&self, index: usize, _total: usize, filename: &str) {
        self.events.lock().unwrap().push(format!("start {index} {filename}"));
    }

    fn on_diagnostic(&self, diagnostic: &Diagnostic) {
        self.events
            .lock()
            .unwrap()
            .push(format!("error {}", diagnostic.filename));
    }

    fn on_file_complete(&self, index: usize, _t: usize, _f: &str, rows: usize, fraction: f32) {
        self.events
            .lock()
            .unwrap()
            .push(format!("done {index} {rows} {fraction:.2}"));
    }

    fn on_batch_complete(&self, total_files: usize, total_rows: usize) {
        self.events
            .lock()
            .unwrap()
            .push(format!("complete {total_files} {total_rows}"));
    }
}

#[tokio::test]
async fn progress_events_arrive_in_order() {
    let recorder = Arc::new(Recorder::default());
    let config = ExtractionConfig::builder()
        .candidate(ScriptedModel::replying("primary", BAKERY, 1) as Arc<dyn VisionModel>)
        .progress_callback(recorder.clone() as Arc<dyn ExtractionProgressCallback>)
        .build()
        .unwrap();
    let corrupt = SourceDocument::new("bad.webp", MediaKind::Image(ImageFormat::WebP), vec![0; 8]);

    extract_documents(
        vec![png_doc("bakery.png"), corrupt],
        &config,
        Some(&credential()),
    )
    .await
    .unwrap();

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "batch 2",
            "start 0 bakery.png",
            "done 0 2 0.50",
            "start 1 bad.webp",
            "error bad.webp",
            "done 1 0 1.00",
            "complete 2 2",
        ]
    );
}

// ── Pause between files ──────────────────────────────────────────────────────

/// Records the (virtual) instant of every file start and of batch completion.
struct Clock {
    origin: tokio::time::Instant,
    starts: Mutex<Vec<Duration>>,
    finished: Mutex<Option<Duration>>,
}

impl ExtractionProgressCallback for Clock {
    fn on_file_start(&self, _index: usize, _total: usize, _filename: &str) {
        self.starts.lock().unwrap().push(self.origin.elapsed());
    }

    fn on_batch_complete(&self, _total_files: usize, _total_rows: usize) {
        *self.finished.lock().unwrap() = Some(self.origin.elapsed());
    }
}

#[tokio::test(start_paused = true)]
async fn pause_runs_only_between_files() {
    let pause = Duration::from_secs(15);
    let clock = Arc::new(Clock {
        origin: tokio::time::Instant::now(),
        starts: Mutex::new(Vec::new()),
        finished: Mutex::new(None),
    });
    let config = ExtractionConfig::builder()
        .candidate(ScriptedModel::replying("primary", BAKERY, 2) as Arc<dyn VisionModel>)
        .inter_file_delay(pause)
        .progress_callback(clock.clone() as Arc<dyn ExtractionProgressCallback>)
        .build()
        .unwrap();

    let output = extract_documents(
        vec![png_doc("a.png"), png_doc("b.png")],
        &config,
        Some(&credential()),
    )
    .await
    .unwrap();
    assert_eq!(output.table.len(), 4);

    let starts = clock.starts.lock().unwrap().clone();
    let finished = clock.finished.lock().unwrap().expect("batch completed");
    assert_eq!(starts.len(), 2);
    assert!(starts[0] < pause, "no pause before the first file: {starts:?}");
    assert!(starts[1] >= pause, "second file waits: {starts:?}");
    assert!(
        finished < pause * 2,
        "no pause after the last file: finished at {finished:?}"
    );
}
