use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use clap::Parser;
use tower::ServiceExt;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use stream_ingest::config::IngestConfig;
use stream_ingest::shutdown::Shutdown;
use stream_ingest::state::AppState;
use stream_ingest::stream::{StatefulStream, StreamAllocator, WebrtcStatefulStream};
use stream_ingest::utils::local_ip_addresses;
use stream_ingest::web::{create_router, HlsRouter};
use stream_ingest::webrtc::IngestApi;

#[derive(Parser)]
struct TestCli {
    #[command(flatten)]
    config: IngestConfig,
}

/// Router over a state whose streams have no media processors
fn test_app() -> (Router, Arc<AppState>) {
    let config = TestCli::try_parse_from([
        "stream-ingest",
        "--udp-port",
        "0",
        "--ice-gather-timeout-secs",
        "3",
        "--broadcaster-id",
        "test-broadcaster",
    ])
    .unwrap()
    .config;

    let api = IngestApi::new(config.webrtc_config()).unwrap();
    let allocator: StreamAllocator = Arc::new(|| Ok(WebrtcStatefulStream::new(vec![], None)));
    let state = AppState::with_allocator(
        &config,
        api,
        Arc::new(Shutdown::new()),
        Arc::new(HlsRouter::new()),
        allocator,
    );
    (create_router(state.clone()), state)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Complete SDP offer of a publisher sending one Opus track
async fn publisher_offer() -> String {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();

    let track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_owned(),
        "publisher".to_owned(),
    ));
    pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .unwrap();

    let offer = pc.create_offer(None).await.unwrap();
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), gather_complete.recv()).await;

    let sdp = pc.local_description().await.unwrap().sdp;
    pc.close().await.unwrap();
    sdp
}

fn post_sdp(uri: &str, sdp: String) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/sdp")
        .header(header::ORIGIN, "https://player.example.com")
        .body(Body::from(sdp))
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_idle_service() {
    let (app, _state) = test_app();

    let response = app
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["broadcaster_id"], "test-broadcaster");
    assert_eq!(json["active_stream"], false);
}

#[tokio::test]
async fn test_whep_without_stream_is_conflict() {
    let (app, _state) = test_app();

    let response = app
        .oneshot(post_sdp("/api/egress/whep", publisher_offer().await))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_whep_preflight_allows_any_origin() {
    let (app, _state) = test_app();

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/egress/whep")
        .header(header::ORIGIN, "https://player.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert!(response.status().is_success());
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_whip_rejects_empty_offer() {
    let (app, state) = test_app();

    let response = app
        .oneshot(post_sdp("/api/ingress/whip", String::new()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(response).await, "bad offer");
    assert!(!state.streams.has_active_stream());
}

#[tokio::test]
async fn test_whip_answers_and_activates_stream() {
    let (app, state) = test_app();

    let response = app
        .clone()
        .oneshot(post_sdp("/api/ingress/whip", publisher_offer().await))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/sdp"
    );
    let answer = body_string(response).await;
    assert!(answer.contains("m=audio"), "answer: {}", answer);
    assert!(answer.to_lowercase().contains("opus"), "answer: {}", answer);
    // Host candidates come from non-loopback IPv4 interfaces
    let has_ipv4 = local_ip_addresses()
        .unwrap_or_default()
        .iter()
        .any(|ip| ip.is_ipv4());
    if has_ipv4 {
        assert!(answer.contains("a=candidate"), "answer: {}", answer);
    }
    assert!(state.streams.has_active_stream());

    // No RTP has arrived yet, so there is nothing to subscribe to
    let response = app
        .oneshot(post_sdp("/api/egress/whep", publisher_offer().await))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    state.shutdown.trigger();
}

#[tokio::test]
async fn test_bad_offer_keeps_live_stream() {
    let (app, state) = test_app();

    let response = app
        .clone()
        .oneshot(post_sdp("/api/ingress/whip", publisher_offer().await))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let live = state.streams.get_stateful_stream().unwrap();

    let response = app
        .oneshot(post_sdp(
            "/api/ingress/whip",
            "v=0\r\nthis is not sdp\r\n".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let current = state.streams.get_stateful_stream().unwrap();
    assert_eq!(current.id(), live.id());
    assert!(!live.is_destroyed());

    state.shutdown.trigger();
}

#[tokio::test]
async fn test_hls_without_processor_is_not_found() {
    let (app, _state) = test_app();

    let response = app
        .clone()
        .oneshot(Request::get("/api/egress/hls").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(
            Request::get("/api/egress/hls/..%2Fsecret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
