use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;

mod common;
use common::{build_upload_multipart_body, setup_test_app};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn small_file_and_text_round_trip() {
    let app = setup_test_app().await;

    let created = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chest")
                .header("Content-Type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let created = body_json(created).await;
    let session_id = created["sessionId"].as_str().unwrap();
    let upload_token = created["uploadToken"].as_str().unwrap();

    let boundary = "chestd-test-boundary";
    let multipart_body = build_upload_multipart_body(
        boundary,
        "a.txt",
        "text/plain",
        b"hello\n",
        Some(r#"{"content":"hi","filename":"b.txt"}"#),
    );

    let uploaded = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/chest/{session_id}/upload"))
                .header("Authorization", format!("Bearer {upload_token}"))
                .header(
                    "Content-Type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(multipart_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(uploaded.status(), StatusCode::CREATED);
    let uploaded = body_json(uploaded).await;
    let files = uploaded["uploadedFiles"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0]["isText"], false);
    assert_eq!(files[1]["isText"], true);
    let a_file_id = files[0]["fileId"].as_str().unwrap().to_string();
    let b_file_id = files[1]["fileId"].as_str().unwrap().to_string();

    let seal_body = json!({
        "fileIds": [a_file_id, b_file_id],
        "validityDays": 7,
    });
    let sealed = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/chest/{session_id}/complete"))
                .header("Authorization", format!("Bearer {upload_token}"))
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(&seal_body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(sealed.status(), StatusCode::OK);
    let sealed = body_json(sealed).await;
    let code = sealed["retrievalCode"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 6);
    assert!(!sealed["expiryDate"].is_null());

    let retrieved = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/api/retrieve/{code}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(retrieved.status(), StatusCode::OK);
    let retrieved = body_json(retrieved).await;
    assert_eq!(retrieved["files"].as_array().unwrap().len(), 2);
    assert!(!retrieved["expiryDate"].is_null());
    let chest_token = retrieved["chestToken"].as_str().unwrap().to_string();

    let download = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/api/download/{a_file_id}"))
                .header("Authorization", format!("Bearer {chest_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(download.status(), StatusCode::OK);
    assert_eq!(
        download.headers().get("content-type").unwrap(),
        "text/plain"
    );
    let disposition = download
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("filename=\"a.txt\""));
    let body = axum::body::to_bytes(download.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(body.as_ref(), b"hello\n");

    let download_b = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/api/download/{b_file_id}"))
                .header("Authorization", format!("Bearer {chest_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body_b = axum::body::to_bytes(download_b.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(body_b.as_ref(), b"hi");
}

#[tokio::test]
async fn permanent_chest_has_null_expiry_everywhere() {
    let app = setup_test_app().await;

    let created = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chest")
                .header("Content-Type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(created).await;
    let session_id = created["sessionId"].as_str().unwrap();
    let upload_token = created["uploadToken"].as_str().unwrap();

    let seal_body = json!({ "fileIds": [], "validityDays": -1 });
    let sealed = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/chest/{session_id}/complete"))
                .header("Authorization", format!("Bearer {upload_token}"))
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(&seal_body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(sealed.status(), StatusCode::OK);
    let sealed = body_json(sealed).await;
    assert!(sealed["expiryDate"].is_null());
    let code = sealed["retrievalCode"].as_str().unwrap().to_string();

    let retrieved = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/api/retrieve/{code}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let retrieved = body_json(retrieved).await;
    assert!(retrieved["expiryDate"].is_null());
}

#[tokio::test]
async fn malformed_code_is_bad_request_unknown_code_is_not_found() {
    let app = setup_test_app().await;

    let malformed = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/retrieve/INVALID")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    let unknown = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/retrieve/ABCD99")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}
