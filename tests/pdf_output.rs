use image::{Rgb, RgbImage, Rgba, RgbaImage};
use lopdf::Document;
use report_forge::{
    AttemptError,
    assemble::{DocumentBuilder, blob_assembly_available, plan_pages},
    config::{Margins, ReportConfig},
    raster::{
        Bitmap, Capabilities, CaptureOptions, RasterBackend, Scene, SceneElement, SceneRasterizer,
        Section,
    },
};

fn opts(quality: f64) -> CaptureOptions {
    CaptureOptions {
        quality,
        background: [255, 255, 255],
    }
}

fn encode(bitmap: &Bitmap, cfg: &ReportConfig) -> Vec<u8> {
    let layout = plan_pages(bitmap.width(), bitmap.height(), &bitmap.keep_together, cfg)
        .expect("layout");
    let slices = layout.slices.clone();
    let mut builder = DocumentBuilder::new(layout, 85).with_title("test");
    for slice in &slices {
        builder.write_page(bitmap, slice).expect("page");
    }
    builder.finish().expect("finish")
}

#[test]
fn assembled_pdf_has_one_page_per_slice() {
    let cfg = ReportConfig {
        margins: Margins {
            top: 23.5,
            right: 10.0,
            bottom: 23.5,
            left: 10.0,
        },
        ..Default::default()
    };
    let bitmap = Bitmap::new(RgbImage::from_pixel(190, 600, Rgb([10, 120, 200])));
    let bytes = encode(&bitmap, &cfg);
    assert!(bytes.starts_with(b"%PDF-"));

    let doc = Document::load_mem(&bytes).expect("reload pdf");
    assert_eq!(doc.get_pages().len(), 3);
}

#[test]
fn builder_without_pages_fails() {
    let cfg = ReportConfig::default();
    let layout = plan_pages(10, 10, &[], &cfg).expect("layout");
    let err = DocumentBuilder::new(layout, 85).finish().expect_err("no pages");
    assert!(matches!(err, AttemptError::Assembly(_)));
}

#[test]
fn host_supports_scene_rasterizer() {
    assert!(blob_assembly_available());
    let caps = Capabilities::detect::<SceneRasterizer>();
    assert!(caps.is_supported());
    assert_eq!(caps.missing(), None);

    let without_blob = Capabilities {
        raster_capture: true,
        blob_assembly: false,
    };
    assert!(!without_blob.is_supported());
    assert!(without_blob.missing().is_some());
}

#[tokio::test]
async fn scene_capture_scales_by_quality_and_fills_background() {
    let mut scene = Scene::new(100, 50);
    scene.elements.push(SceneElement::Rect {
        x: 0.0,
        y: 0.0,
        width: 50.0,
        height: 50.0,
        color: [255, 0, 0, 255],
    });
    scene.sections.push(Section {
        name: "summary".into(),
        top: 10.0,
        bottom: 20.0,
    });

    let bitmap = SceneRasterizer::new()
        .capture(&scene, &opts(2.0))
        .await
        .expect("capture");
    assert_eq!((bitmap.width(), bitmap.height()), (200, 100));
    assert_eq!(bitmap.image.get_pixel(10, 10), &Rgb([255, 0, 0]));
    // Transparent area takes the fill color.
    assert_eq!(bitmap.image.get_pixel(150, 50), &Rgb([255, 255, 255]));
    assert_eq!(bitmap.keep_together.len(), 1);
    assert_eq!(bitmap.keep_together[0].top, 20);
    assert_eq!(bitmap.keep_together[0].bottom, 40);
}

#[tokio::test]
async fn detached_or_empty_surface_fails_capture() {
    let mut scene = Scene::new(100, 100);
    scene.attached = false;
    let err = SceneRasterizer::new()
        .capture(&scene, &opts(1.0))
        .await
        .expect_err("detached");
    assert!(matches!(err, AttemptError::RenderCapture(_)));

    let err = SceneRasterizer::new()
        .capture(&Scene::new(0, 100), &opts(1.0))
        .await
        .expect_err("zero size");
    assert!(matches!(err, AttemptError::RenderCapture(_)));
}

#[tokio::test]
async fn missing_asset_leaves_blank_region_unless_strict() {
    let mut scene = Scene::new(40, 40);
    scene.elements.push(SceneElement::Image {
        x: 0.0,
        y: 0.0,
        width: 20.0,
        height: 20.0,
        source: "/nonexistent/cross-origin.png".into(),
    });

    let bitmap = SceneRasterizer::new()
        .capture(&scene, &opts(1.0))
        .await
        .expect("tolerant capture");
    assert_eq!(bitmap.image.get_pixel(5, 5), &Rgb([255, 255, 255]));

    let err = SceneRasterizer::new()
        .strict_assets(true)
        .capture(&scene, &opts(1.0))
        .await
        .expect_err("strict capture");
    assert!(matches!(err, AttemptError::AssetLoad(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn image_assets_are_painted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("chart.png");
    RgbaImage::from_pixel(4, 4, Rgba([0, 200, 0, 255]))
        .save(&path)
        .expect("write png");

    let mut scene = Scene::new(40, 40);
    scene.elements.push(SceneElement::Image {
        x: 10.0,
        y: 10.0,
        width: 20.0,
        height: 20.0,
        source: path,
    });
    let bitmap = SceneRasterizer::new()
        .capture(&scene, &opts(1.0))
        .await
        .expect("capture");
    assert_eq!(bitmap.image.get_pixel(20, 20), &Rgb([0, 200, 0]));
    assert_eq!(bitmap.image.get_pixel(2, 2), &Rgb([255, 255, 255]));
}

#[test]
fn scene_loads_relative_sources_from_file_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("surface.json");
    std::fs::write(
        &path,
        r#"{"width": 10, "height": 10, "elements": [
            {"kind": "image", "x": 0, "y": 0, "width": 5, "height": 5, "source": "logo.png"}
        ]}"#,
    )
    .expect("write scene");
    let scene = Scene::load(&path).expect("load");
    assert!(scene.attached);
    match &scene.elements[0] {
        SceneElement::Image { source, .. } => assert_eq!(source, &dir.path().join("logo.png")),
        other => panic!("unexpected element {other:?}"),
    }
}
