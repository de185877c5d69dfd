//! End-to-end acquisition tests against a local HTTP fixture server and a
//! stub remuxer binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use grab_engine::{Engine, EngineConfig, GrabError, NullSink, ShowDescriptor};

#[derive(Clone)]
struct Route {
    status: u16,
    body: Vec<u8>,
    delay: Duration,
}

impl Route {
    fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn error(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            delay: Duration::ZERO,
        }
    }
}

/// Tiny single-purpose HTTP/1.1 responder for the fixtures.
async fn start_server(routes: HashMap<String, Route>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let request = String::from_utf8_lossy(&request);
                let path = request.split_whitespace().nth(1).unwrap_or("/");

                let response = match routes.get(path) {
                    Some(route) => {
                        tokio::time::sleep(route.delay).await;
                        let mut bytes = format!(
                            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            route.status,
                            if route.status == 200 { "OK" } else { "Error" },
                            route.body.len()
                        )
                        .into_bytes();
                        bytes.extend_from_slice(&route.body);
                        bytes
                    }
                    None => {
                        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_vec()
                    }
                };
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    format!("http://{addr}")
}

/// Stub remuxer: emits a plausible progress transcript on stderr and writes
/// a marker file at the output path (its last argument).
#[cfg(unix)]
fn write_stub_ffmpeg(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("stub-ffmpeg");
    std::fs::write(
        &path,
        concat!(
            "#!/bin/sh\n",
            "out=\"\"\n",
            "for a in \"$@\"; do out=\"$a\"; done\n",
            "echo \"Duration: 00:00:20.00, start: 0.000000\" >&2\n",
            "echo \"size= 1kB time=00:00:10.00 bitrate=x\" >&2\n",
            "echo \"Lsize= 2kB time=00:00:20.00 bitrate=x\" >&2\n",
            "printf combined > \"$out\"\n",
            "exit 0\n",
        ),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn manifest_doc() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" mediaPresentationDuration="PT20S">
  <Period>
    <AdaptationSet contentType="video">
      <SegmentTemplate media="video/$Number$.m4s" startNumber="1" duration="4" timescale="1"/>
      <Representation id="v" bandwidth="500"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio">
      <SegmentTemplate media="audio/$RepresentationID$/$Number$.m4s" startNumber="1" duration="4" timescale="1"/>
      <Representation id="a64" bandwidth="64"/>
      <Representation id="a128" bandwidth="128"/>
    </AdaptationSet>
  </Period>
</MPD>"#
        .to_string()
}

fn base_routes() -> HashMap<String, Route> {
    let mut routes = HashMap::new();
    routes.insert("/manifest.mpd".to_string(), Route::ok(manifest_doc()));
    for n in 1..=5 {
        routes.insert(
            format!("/video/{n}.m4s"),
            Route::ok(format!("v{n}")).with_delay(Duration::from_millis(30)),
        );
        routes.insert(format!("/audio/a128/{n}.m4s"), Route::ok(format!("a{n}")));
    }
    routes
}

fn descriptor(base: &str, output: PathBuf) -> ShowDescriptor {
    ShowDescriptor {
        id: "show-1".to_string(),
        title: "Episode One".to_string(),
        manifest_url: format!("{base}/manifest.mpd"),
        output,
        synopsis: Some("A beginning.".to_string()),
        show_name: Some("The Show".to_string()),
        channel: Some("TV1".to_string()),
        episode_image: None,
        show_image: None,
    }
}

fn engine(ffmpeg: Option<PathBuf>) -> Engine {
    let config = EngineConfig {
        ffmpeg_path: ffmpeg.map(|p| p.to_string_lossy().to_string()),
        stall_timeout: Duration::from_secs(5),
        job_workers: 1,
        ..Default::default()
    };
    Engine::new(config).unwrap()
}

#[cfg(unix)]
#[tokio::test]
async fn successful_job_leaves_only_the_final_output() {
    let dir = tempfile::TempDir::new().unwrap();
    let stub = write_stub_ffmpeg(dir.path());

    let mut routes = base_routes();
    routes.insert("/thumb.jpg".to_string(), Route::ok(&b"jpegdata"[..]));
    routes.insert("/poster.jpg".to_string(), Route::ok(&b"posterdata"[..]));
    let base = start_server(routes).await;

    let dest = dir.path().join("library");
    let output = dest.join("The.Show.S01E01.mp4");
    let mut show = descriptor(&base, output.clone());
    show.episode_image = Some(format!("{base}/thumb.jpg"));
    show.show_image = Some(format!("{base}/poster.jpg"));

    let engine = engine(Some(stub));
    let outcome = engine
        .run_job(&show, Arc::new(NullSink), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.output, output);
    assert!(outcome.bytes_downloaded > 0);

    assert_eq!(std::fs::read_to_string(&output).unwrap(), "combined");
    assert!(!dest.join("The.Show.S01E01.mp4.video.part").exists());
    assert!(!dest.join("The.Show.S01E01.mp4.audio.part").exists());

    // Thumbnails colocated with the output.
    assert!(dest.join("The.Show.S01E01.jpg").exists());
    assert!(dest.join("folder.jpg").exists());
}

#[tokio::test]
async fn audio_failure_cancels_video_and_leaves_no_files() {
    let dir = tempfile::TempDir::new().unwrap();

    // Selection must pick the 128k audio representation; its 3rd segment
    // returns a server error while the slower video stream is mid-flight.
    let mut routes = base_routes();
    routes.insert("/audio/a128/3.m4s".to_string(), Route::error(500));
    let base = start_server(routes).await;

    let dest = dir.path().join("library");
    let show = descriptor(&base, dest.join("The.Show.S01E01.mp4"));

    let engine = engine(None);
    let err = engine
        .run_job(&show, Arc::new(NullSink), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        GrabError::HttpStatus { status, url } => {
            assert_eq!(status.as_u16(), 500);
            assert!(url.ends_with("/audio/a128/3.m4s"));
        }
        other => panic!("expected segment failure, got {other}"),
    }

    let leftovers: Vec<_> = std::fs::read_dir(&dest)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
}

#[tokio::test]
async fn cancelled_job_leaves_no_files() {
    let dir = tempfile::TempDir::new().unwrap();

    let mut routes = base_routes();
    for n in 1..=5 {
        routes.insert(
            format!("/audio/a128/{n}.m4s"),
            Route::ok(format!("a{n}")).with_delay(Duration::from_millis(30)),
        );
    }
    let base = start_server(routes).await;

    let dest = dir.path().join("library");
    let show = descriptor(&base, dest.join("The.Show.S01E01.mp4"));

    let engine = engine(None);
    let cancel = CancellationToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let err = engine
        .run_job(&show, Arc::new(NullSink), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    trigger.await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(&dest)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
}

#[tokio::test]
async fn missing_audio_stream_aborts_before_writing_anything() {
    let dir = tempfile::TempDir::new().unwrap();

    let doc = r#"<MPD mediaPresentationDuration="PT20S"><Period>
        <AdaptationSet contentType="video">
          <SegmentTemplate media="video/$Number$.m4s" duration="4" timescale="1"/>
          <Representation id="v" bandwidth="500"/>
        </AdaptationSet>
    </Period></MPD>"#;
    let mut routes = HashMap::new();
    routes.insert("/manifest.mpd".to_string(), Route::ok(doc));
    let base = start_server(routes).await;

    let dest = dir.path().join("library");
    let show = descriptor(&base, dest.join("The.Show.S01E01.mp4"));

    let engine = engine(None);
    let err = engine
        .run_job(&show, Arc::new(NullSink), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, GrabError::MissingStream { .. }));
    assert!(!dest.exists(), "nothing may be created before downloading");
}

#[cfg(unix)]
#[tokio::test]
async fn direct_job_repackages_a_single_stream() {
    let dir = tempfile::TempDir::new().unwrap();
    let stub = write_stub_ffmpeg(dir.path());

    let mut routes = HashMap::new();
    routes.insert(
        "/stream.mp4".to_string(),
        Route::ok(vec![0u8; 4096]),
    );
    let base = start_server(routes).await;

    let dest = dir.path().join("library");
    let output = dest.join("Documentary.mp4");
    let mut show = descriptor(&base, output.clone());
    show.manifest_url = format!("{base}/stream.mp4");

    let engine = engine(Some(stub));
    let outcome = engine
        .run_direct_job(&show, Arc::new(NullSink), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.bytes_downloaded, 4096);
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "combined");
    assert!(!dest.join("Documentary.mp4.direct.part").exists());
}
