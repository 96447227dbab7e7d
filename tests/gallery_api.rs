use axum::http::StatusCode;
use axum_test::TestServer;
use folio::{Config, create_app};
use serde_json::Value;
use std::time::Duration;
use tempfile::TempDir;

/// Helper to create a test configuration pointing at a fresh photo directory
fn create_test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();

    let photos_dir = temp_dir.path().join("photos");
    std::fs::create_dir_all(&photos_dir).unwrap();
    config.gallery.source_directory = photos_dir;

    config
}

/// Helper to write real images of known sizes
fn create_test_images(dir: &std::path::Path, sizes: &[(&str, u32, u32)]) {
    use image::{ImageBuffer, Rgb};

    for (name, width, height) in sizes {
        let img = ImageBuffer::from_fn(*width, *height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        img.save(&path).unwrap();
    }
}

async fn test_server(config: Config) -> TestServer {
    let app = create_app(config).await.unwrap();
    TestServer::new(app).unwrap()
}

#[tokio::test]
async fn test_gallery_layout_for_scanned_directory() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    create_test_images(
        &config.gallery.source_directory,
        &[
            ("a.png", 40, 60),
            ("b.png", 60, 30),
            ("Street/c.png", 30, 30),
        ],
    );

    let server = test_server(config).await;
    let response = server.get("/api/gallery").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let json: Value = response.json();
    assert_eq!(json["empty"], false);
    assert_eq!(json["view"]["kind"], "grid");
    assert_eq!(json["view"]["total"], 3);
    assert_eq!(json["view"]["has_more"], false);

    let items = json["items"].as_array().unwrap();
    let sources: Vec<&str> = items.iter().map(|i| i["src"].as_str().unwrap()).collect();
    assert_eq!(
        sources,
        vec!["/photos/Street/c.png", "/photos/a.png", "/photos/b.png"]
    );
    assert_eq!(items[0]["category"], "Street");

    // Local files pass through untouched
    assert_eq!(items[1]["url"], "/photos/a.png");
    assert_eq!(items[1]["placeholder"], "/photos/a.png");
    assert_eq!(items[1]["srcset"], "");
}

#[tokio::test]
async fn test_gallery_layout_empty_directory() {
    let temp_dir = TempDir::new().unwrap();
    let server = test_server(create_test_config(&temp_dir)).await;

    let json: Value = server.get("/api/gallery").await.json();
    assert_eq!(json["empty"], true);
    assert_eq!(json["view"]["kind"], "empty");
    assert!(json["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_gallery_layout_from_manifest_with_query() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(&temp_dir);

    let records: Vec<Value> = (0..23)
        .map(|i| {
            serde_json::json!({
                "src": format!("https://res.cloudinary.com/demo/image/upload/v1/portfolio/{}.jpg", i),
                "alt": format!("photo {}", i),
                "category": if i < 12 { "Portrait" } else { "Landscape" },
            })
        })
        .collect();
    let manifest = temp_dir.path().join("images.json");
    std::fs::write(&manifest, serde_json::to_string(&records).unwrap()).unwrap();
    config.gallery.manifest = Some(manifest);

    let server = test_server(config).await;

    let json: Value = server
        .get("/api/gallery")
        .add_query_param("width", 1400)
        .add_query_param("columns", 4)
        .add_query_param("chunks", 2)
        .await
        .json();
    assert_eq!(json["view"]["visible_count"], 20);
    assert_eq!(json["view"]["has_more"], true);
    assert_eq!(json["view"]["state"]["column_count"], 4);
    assert_eq!(
        json["view"]["layout"]["columns"].as_array().unwrap().len(),
        4
    );

    let first = &json["items"][0];
    assert!(first["url"].as_str().unwrap().contains("w_800,c_fill"));
    assert!(first["lightbox"].as_str().unwrap().contains("w_1600"));
    assert!(first["srcset"].as_str().unwrap().ends_with("1600w"));

    let json: Value = server
        .get("/api/gallery")
        .add_query_param("width", 500)
        .add_query_param("category", "Landscape")
        .await
        .json();
    assert_eq!(json["view"]["visible_count"], 10);
    assert_eq!(json["view"]["total"], 11);
    assert_eq!(json["view"]["state"]["column_count"], 1);
}

#[tokio::test]
async fn test_transform_endpoint() {
    let temp_dir = TempDir::new().unwrap();
    let server = test_server(create_test_config(&temp_dir)).await;

    let json: Value = server
        .get("/api/transform")
        .add_query_param(
            "src",
            "https://res.cloudinary.com/demo/image/upload/v1741575488/portfolio/elegance.jpg",
        )
        .add_query_param("width", 800)
        .add_query_param("quality", 85)
        .await
        .json();
    assert_eq!(json["is_cdn"], true);
    assert_eq!(
        json["url"],
        "https://res.cloudinary.com/demo/image/upload/f_auto,fl_progressive,q_75,w_800,c_fill/v1741575488/portfolio/elegance.jpg"
    );

    let external = "https://images.example.com/photos/a.jpg?w=100";
    let json: Value = server
        .get("/api/transform")
        .add_query_param("src", external)
        .add_query_param("width", 800)
        .await
        .json();
    assert_eq!(json["is_cdn"], false);
    assert_eq!(json["url"], external);
    assert_eq!(json["placeholder"], external);

    let response = server
        .get("/api/transform")
        .add_query_param("src", "")
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server.get("/api/transform").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_prefetch_fills_dimension_cache() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    create_test_images(
        &config.gallery.source_directory,
        &[("tall.png", 40, 80), ("wide.png", 80, 40)],
    );
    // Unreadable image: measured as unknown, never fatal
    std::fs::write(config.gallery.source_directory.join("broken.jpg"), b"nope").unwrap();

    let server = test_server(config).await;

    let response = server.post("/api/prefetch").await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
    let json: Value = response.json();
    assert_eq!(json["scheduled"], 3);

    let mut dimensions = Value::Null;
    for _ in 0..100 {
        dimensions = server.get("/api/dimensions").await.json();
        if dimensions["count"] == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(dimensions["count"], 2);
    assert_eq!(dimensions["entries"]["/photos/tall.png"]["aspect_ratio"], 2.0);
    assert_eq!(dimensions["entries"]["/photos/wide.png"]["width"], 80);

    // The layout now uses measured ratios for the probed images
    let json: Value = server.get("/api/gallery").await.json();
    let placed: Vec<&Value> = json["view"]["layout"]["columns"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|column| column.as_array().unwrap())
        .collect();
    let tall = placed
        .iter()
        .find(|p| p["src"] == "/photos/tall.png")
        .unwrap();
    assert_eq!(tall["source"], "cache");
    assert_eq!(tall["aspect_ratio"], 2.0);
    let broken = placed
        .iter()
        .find(|p| p["src"] == "/photos/broken.jpg")
        .unwrap();
    assert_eq!(broken["source"], "estimate");
}

#[tokio::test]
async fn test_photo_files_are_served() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    create_test_images(&config.gallery.source_directory, &[("a.png", 10, 10)]);
    std::fs::write(temp_dir.path().join("secret.txt"), b"secret").unwrap();

    let server = test_server(config).await;

    let response = server.get("/photos/a.png").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.header("content-type"), "image/png");
    assert!(response.headers().get("etag").is_some());
    assert!(response.headers().get("last-modified").is_some());

    let response = server.get("/photos/missing.png").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let response = server.get("/photos/%2E%2E/secret.txt").await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}
