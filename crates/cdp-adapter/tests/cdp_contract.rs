//! Contract tests against a real Chromium binary. Ignored by default; they need
//! Chrome/Chromium on the host and `CIPHERSCOPE_CDP_CONTRACT=1`.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::Router;
use cdp_adapter::{pump_events, CdpConfig, ChromiumTransport, NetworkAssembler, PageSession, TargetSelector};
use cipherscope_correlator::bridge::{self, DRAIN_EXPRESSION, INSTALLER};
use cipherscope_correlator::model::{CallSite, EventPhase};
use cipherscope_correlator::{EvalError, PageEvaluator, PlainEvent};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Page with an axios-shaped client whose own interceptors encrypt requests and decrypt
/// responses. Request interceptors run last-added-first, response interceptors in order.
const CLIENT_PAGE: &str = r#"<!doctype html>
<html><head><script>
(function () {
  function make(defaults) {
    var requestHandlers = [];
    var responseHandlers = [];
    return {
      defaults: defaults,
      interceptors: {
        request: { use: function (f) { requestHandlers.unshift(f); } },
        response: { use: function (f) { responseHandlers.push(f); } }
      },
      request: function (config) {
        var chain = Promise.resolve(Object.assign({}, defaults, config));
        requestHandlers.forEach(function (h) { chain = chain.then(h); });
        chain = chain.then(function (sent) {
          return { data: { data: 'CIPHERTEXT-RESP' }, status: 200, config: sent };
        });
        responseHandlers.forEach(function (h) { chain = chain.then(h); });
        return chain;
      },
      post: function (url, data) { return this.request({ method: 'post', url: url, data: data }); },
      create: function (extra) { return make(Object.assign({}, defaults, extra)); }
    };
  }
  window.axios = make({});
  window.http = window.axios.create({ baseURL: '' });
  window.http.interceptors.request.use(function (config) {
    config.data = 'ENC(' + JSON.stringify(config.data) + ')';
    return config;
  });
  window.http.interceptors.response.use(function (resp) {
    resp.data = { ok: 'decrypted' };
    return resp;
  });
})();
</script></head><body>cipherscope</body></html>"#;

/// One call through every wrapped family; resolves to what the page code itself received.
const EXERCISE_PAGE: &str = r#"(async function () {
  var json = JSON.stringify({ hello: 'world' });
  var viaFetch = await (await fetch('/api/echo?via=fetch', {
    method: 'POST', headers: { 'Content-Type': 'application/json' }, body: json
  })).json();
  var viaRequest = await (await fetch(new Request('/api/echo?via=request', {
    method: 'POST', body: json
  }))).json();
  var viaXhr = await new Promise(function (resolve, reject) {
    var xhr = new XMLHttpRequest();
    xhr.open('POST', '/api/echo?via=xhr');
    xhr.setRequestHeader('Content-Type', 'application/json');
    xhr.onload = function () { resolve(JSON.parse(xhr.responseText)); };
    xhr.onerror = reject;
    xhr.send(json);
  });
  var viaClient = (await window.http.post('/api/echo?via=client', { hello: 'world' })).data;
  return { fetch: viaFetch, request: viaRequest, xhr: viaXhr, client: viaClient };
})()"#;

/// A broken buffer must not change what the caller of `fetch` sees.
const BROKEN_BUFFER_FETCH: &str = r#"(async function () {
  var saved = window.__cipherscopeEvents;
  window.__cipherscopeEvents = null;
  try {
    var resp = await fetch('/api/echo?via=broken', { method: 'POST', body: '{"n":1}' });
    return await resp.json();
  } finally {
    window.__cipherscopeEvents = saved;
  }
})()"#;

async fn echo(body: String) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], body)
}

async fn serve_client_page() -> SocketAddr {
    let router = Router::new()
        .route("/", get(|| async { Html(CLIENT_PAGE) }))
        .route("/api/echo", post(echo));
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("bind page server");
    let addr = listener.local_addr().expect("page server address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router.into_make_service()).await;
    });
    addr
}

async fn drain_until(page: &PageSession, expected: usize) -> Vec<PlainEvent> {
    let mut events = Vec::new();
    for _ in 0..50 {
        events.extend(bridge::drain(page).await);
        if events.len() >= expected {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    // late duplicates would show up here
    sleep(Duration::from_millis(300)).await;
    events.extend(bridge::drain(page).await);
    events
}

fn only<'a>(events: &'a [PlainEvent], site: CallSite, phase: EventPhase, via: &str) -> &'a PlainEvent {
    let path = format!("/api/echo?via={via}");
    let matching: Vec<_> = events
        .iter()
        .filter(|e| e.site == site && e.phase == phase && e.path.as_deref() == Some(path.as_str()))
        .collect();
    assert_eq!(matching.len(), 1, "{site:?} {phase:?} {via}: {events:#?}");
    matching[0]
}

fn contract_enabled() -> bool {
    env::var("CIPHERSCOPE_CDP_CONTRACT")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

async fn attach() -> (Arc<ChromiumTransport>, PageSession) {
    let transport = Arc::new(
        ChromiumTransport::connect(&CdpConfig::default())
            .await
            .expect("chromium connects"),
    );
    let page = PageSession::attach(transport.clone(), &TargetSelector::default())
        .await
        .expect("page attaches");
    page.prepare(INSTALLER, true).await.expect("domains enabled");
    (transport, page)
}

#[tokio::test]
#[ignore = "requires Chrome/Chromium; set CIPHERSCOPE_CDP_CONTRACT=1"]
async fn contract_evaluates_and_installs_bridge() {
    if !contract_enabled() {
        eprintln!("skipping CDP contract test (CIPHERSCOPE_CDP_CONTRACT not enabled)");
        return;
    }

    let (transport, page) = attach().await;
    assert_eq!(page.evaluate("1 + 1").await.unwrap(), json!(2));
    assert!(matches!(
        page.evaluate("(() => { throw new Error('nope') })()").await,
        Err(EvalError::Exception(_))
    ));

    // the new-document script already ran, so a second install is a no-op
    page.navigate("about:blank").await.expect("navigate");
    assert_eq!(page.evaluate(INSTALLER).await.unwrap(), Value::Bool(false));
    assert_eq!(page.evaluate(DRAIN_EXPRESSION).await.unwrap(), json!([]));

    transport.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Chrome/Chromium; set CIPHERSCOPE_CDP_CONTRACT=1"]
async fn contract_assembles_network_records() {
    if !contract_enabled() {
        eprintln!("skipping CDP contract test (CIPHERSCOPE_CDP_CONTRACT not enabled)");
        return;
    }

    let (transport, page) = attach().await;
    let (tx, mut rx) = mpsc::channel(32);
    let assembler = NetworkAssembler::new(transport.clone(), page.session_id(), tx, true);
    let cancel = CancellationToken::new();
    let pump = tokio::spawn(pump_events(assembler, cancel.clone()));

    page.navigate("https://example.com").await.expect("navigate");
    let record = timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("record in time")
        .expect("channel open");
    assert!(record.request.url.starts_with("https://example.com"));
    assert!(record.started_at.is_some());

    cancel.cancel();
    let _ = pump.await;
    transport.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Chrome/Chromium; set CIPHERSCOPE_CDP_CONTRACT=1"]
async fn contract_wrappers_record_each_call_once_with_plaintext() {
    if !contract_enabled() {
        eprintln!("skipping CDP contract test (CIPHERSCOPE_CDP_CONTRACT not enabled)");
        return;
    }

    let addr = serve_client_page().await;
    let (transport, page) = attach().await;
    page.navigate(&format!("http://{addr}/")).await.expect("navigate");
    sleep(Duration::from_millis(500)).await;

    // second install on a patched page changes nothing
    assert_eq!(page.evaluate(INSTALLER).await.unwrap(), Value::Bool(false));
    let _ = bridge::drain(&page).await;

    let seen = page.evaluate(EXERCISE_PAGE).await.expect("page calls succeed");
    let hello = json!({ "hello": "world" });
    assert_eq!(seen["fetch"], hello, "fetch caller still reads the body");
    assert_eq!(seen["request"], hello);
    assert_eq!(seen["xhr"], hello);
    assert_eq!(seen["client"], json!({ "ok": "decrypted" }));

    let events = drain_until(&page, 8).await;
    assert_eq!(events.len(), 8, "{events:#?}");
    for (site, via) in [
        (CallSite::Fetch, "fetch"),
        (CallSite::Fetch, "request"),
        (CallSite::Xhr, "xhr"),
    ] {
        let sent = only(&events, site, EventPhase::Request, via);
        assert_eq!(sent.method, "POST");
        assert_eq!(sent.body, Some(hello.clone()), "{via} request body parsed");
        let received = only(&events, site, EventPhase::Response, via);
        assert_eq!(received.body, Some(hello.clone()), "{via} response body parsed");
        assert_eq!(received.status, Some(200));
    }

    // the client family sees the payload before its own interceptors encrypt it
    // and after they decrypt the reply
    let sent = only(&events, CallSite::Client, EventPhase::Request, "client");
    assert_eq!(sent.body, Some(hello.clone()));
    let received = only(&events, CallSite::Client, EventPhase::Response, "client");
    assert_eq!(received.body, Some(json!({ "ok": "decrypted" })));

    let echoed = page
        .evaluate(BROKEN_BUFFER_FETCH)
        .await
        .expect("fetch unaffected by a broken buffer");
    assert_eq!(echoed, json!({ "n": 1 }));

    transport.shutdown().await;
}
