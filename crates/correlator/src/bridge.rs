//! In-page capture agent: installer, buffer drain and decryption call expressions.
//!
//! The installer runs in the inspected page's global context. It is guarded by a frozen,
//! non-configurable marker so repeated injection (explicit install plus re-injection on every
//! new document) never patches a call site twice. Each wrapper records into a page-global
//! buffer and swallows its own failures so the wrapped call behaves exactly as unwrapped.

use serde_json::Value;
use tracing::{debug, warn};

use crate::eval::{evaluate_or_none, PageEvaluator};
use crate::model::PlainEvent;

/// Page-global marker property guarding the installer.
pub const INSTALL_MARKER: &str = "__cipherscopeInstalled";

/// Page-global buffer the wrappers append to and the poller swaps out.
pub const BUFFER_BINDING: &str = "__cipherscopeEvents";

/// Installer source; evaluates to `true` when it patched the page, `false` when already present.
pub const INSTALLER: &str = r#"(function () {
  if (window.__cipherscopeInstalled) { return false; }
  try {
    Object.defineProperty(window, '__cipherscopeInstalled', {
      value: true, writable: false, configurable: false, enumerable: false
    });
  } catch (_) { return false; }
  window.__cipherscopeEvents = [];

  var locate = function (raw) {
    try {
      var u = new URL(String(raw), location.href);
      return { url: u.href, path: u.pathname + u.search };
    } catch (_) {
      return { url: String(raw), path: null };
    }
  };

  var decode = function (data) {
    if (data == null) { return null; }
    if (typeof data === 'string') {
      var t = data.trim();
      if ((t.charAt(0) === '{' && t.charAt(t.length - 1) === '}') ||
          (t.charAt(0) === '[' && t.charAt(t.length - 1) === ']')) {
        try { return JSON.parse(t); } catch (_) { return data; }
      }
      return data;
    }
    if (typeof data === 'object') {
      if (typeof ArrayBuffer !== 'undefined' && (data instanceof ArrayBuffer || ArrayBuffer.isView(data))) {
        return '[binary] ' + data.byteLength + ' bytes';
      }
      if (typeof Blob !== 'undefined' && data instanceof Blob) { return '[blob] ' + data.size + ' bytes'; }
      if (typeof FormData !== 'undefined' && data instanceof FormData) { return '[form-data]'; }
      if (typeof URLSearchParams !== 'undefined' && data instanceof URLSearchParams) { return data.toString(); }
      try { return JSON.parse(JSON.stringify(data)); } catch (_) { return String(data); }
    }
    return data;
  };

  var record = function (site, phase, method, rawUrl, body, status, ts) {
    try {
      var loc = locate(rawUrl);
      window.__cipherscopeEvents.push({
        site: site,
        phase: phase,
        method: String(method || 'GET').toUpperCase(),
        url: loc.url,
        path: loc.path,
        body: decode(body),
        ts: ts == null ? Date.now() : ts,
        status: status == null ? null : status
      });
    } catch (_) {}
  };

  var clientUrl = function (config) {
    var u = String(config.url || '');
    var base = config.baseURL ? String(config.baseURL) : '';
    if (!base || /^[a-z][a-z0-9+.-]*:/i.test(u)) { return u; }
    return base.replace(/\/+$/, '') + '/' + u.replace(/^\/+/, '');
  };

  // The client's own interceptors encrypt requests and decrypt responses, so the capture
  // point sits outside the chain: arguments on entry, resolved value on exit.
  var clientDepth = 0;
  var wrapRequest = function (owner) {
    try {
      if (!owner || typeof owner.request !== 'function' || owner.request.__cipherscope) { return; }
      var nativeRequest = owner.request;
      var wrappedRequest = function (configOrUrl, extra) {
        var outer = clientDepth === 0;
        var method = 'get';
        var url = '';
        if (outer) {
          try {
            var config = typeof configOrUrl === 'string' ? (extra || {}) : (configOrUrl || {});
            var defaults = (this && this.defaults) || {};
            method = config.method || defaults.method || 'get';
            url = clientUrl({
              url: typeof configOrUrl === 'string' ? configOrUrl : config.url,
              baseURL: config.baseURL || defaults.baseURL
            });
            record('client', 'request', method, url, config.data);
          } catch (_) {}
        }
        var pending;
        clientDepth += 1;
        try {
          pending = nativeRequest.apply(this, arguments);
        } finally {
          clientDepth -= 1;
        }
        if (outer) {
          try {
            if (pending && typeof pending.then === 'function') {
              pending.then(function (resp) {
                try {
                  var cfg = (resp && resp.config) || {};
                  record('client', 'response', cfg.method || method, cfg.url ? clientUrl(cfg) : url,
                    resp ? resp.data : null, resp ? resp.status : null);
                } catch (_) {}
              }, function () {});
            }
          } catch (_) {}
        }
        return pending;
      };
      wrappedRequest.__cipherscope = true;
      owner.request = wrappedRequest;
    } catch (_) {}
  };

  var hookClient = function (client) {
    try {
      if (!client || client.__cipherscopeHooked) { return; }
      Object.defineProperty(client, '__cipherscopeHooked', { value: true });
      if (client.Axios && client.Axios.prototype) { wrapRequest(client.Axios.prototype); }
      if (Object.prototype.hasOwnProperty.call(client, 'request')) { wrapRequest(client); }
      if (typeof client.create === 'function' && !client.create.__cipherscope) {
        var create = client.create;
        var wrappedCreate = function () {
          var instance = create.apply(this, arguments);
          hookClient(instance);
          return instance;
        };
        wrappedCreate.__cipherscope = true;
        client.create = wrappedCreate;
      }
    } catch (_) {}
  };
  window.__cipherscopeRehook = function () { hookClient(window.axios); };
  if (window.axios) {
    hookClient(window.axios);
  } else {
    // a client assigned later (script tag after this agent) is hooked before the app uses it
    try {
      var assigned;
      Object.defineProperty(window, 'axios', {
        configurable: true,
        enumerable: true,
        get: function () { return assigned; },
        set: function (client) { assigned = client; hookClient(client); }
      });
    } catch (_) {}
  }

  if (typeof window.fetch === 'function' && !window.fetch.__cipherscope) {
    var nativeFetch = window.fetch;
    var wrappedFetch = function (input, init) {
      var method = 'GET';
      var url = '';
      try {
        var sentAt = Date.now();
        var isRequest = typeof Request !== 'undefined' && input instanceof Request;
        if (input && typeof input === 'object' && 'url' in input) {
          url = input.url;
          method = input.method || method;
        } else {
          url = String(input);
        }
        if (init && init.method) { method = init.method; }
        if (init && init.body != null) {
          record('fetch', 'request', method, url, init.body, null, sentAt);
        } else if (isRequest && input.body != null && !input.bodyUsed) {
          var sentMethod = method;
          var sentUrl = url;
          input.clone().text().then(function (text) {
            record('fetch', 'request', sentMethod, sentUrl, text, null, sentAt);
          }, function () {
            record('fetch', 'request', sentMethod, sentUrl, null, null, sentAt);
          });
        } else {
          record('fetch', 'request', method, url, null, null, sentAt);
        }
      } catch (_) {}
      var pending = nativeFetch.apply(this == null ? window : this, arguments);
      try {
        pending.then(function (resp) {
          try {
            resp.clone().text().then(function (text) {
              record('fetch', 'response', method, url, text, resp.status);
            }, function () {});
          } catch (_) {}
        }, function () {});
      } catch (_) {}
      return pending;
    };
    wrappedFetch.__cipherscope = true;
    window.fetch = wrappedFetch;
  }

  var Xhr = window.XMLHttpRequest;
  if (Xhr && Xhr.prototype && !Xhr.prototype.__cipherscope) {
    Object.defineProperty(Xhr.prototype, '__cipherscope', { value: true });
    var nativeOpen = Xhr.prototype.open;
    var nativeSend = Xhr.prototype.send;
    Xhr.prototype.open = function (method, url) {
      try { this.__cipherscopeRequest = { method: method, url: String(url) }; } catch (_) {}
      return nativeOpen.apply(this, arguments);
    };
    Xhr.prototype.send = function (body) {
      try {
        var xhr = this;
        var meta = xhr.__cipherscopeRequest;
        if (meta) {
          record('xhr', 'request', meta.method, meta.url, body);
          xhr.addEventListener('loadend', function () {
            try {
              var payload = null;
              if (xhr.responseType === '' || xhr.responseType === 'text') {
                payload = xhr.responseText;
              } else if (xhr.responseType === 'json') {
                payload = xhr.response;
              }
              record('xhr', 'response', meta.method, meta.url, payload, xhr.status);
            } catch (_) {}
          });
        }
      } catch (_) {}
      return nativeSend.apply(this, arguments);
    };
  }
  return true;
})()"#;

/// Swaps the page buffer for an empty one and returns the previous contents.
///
/// Also re-checks for an HTTP client object that appeared after installation.
pub const DRAIN_EXPRESSION: &str = r#"(function () {
  try { if (typeof window.__cipherscopeRehook === 'function') { window.__cipherscopeRehook(); } } catch (_) {}
  var buffer = window.__cipherscopeEvents;
  if (!Array.isArray(buffer)) { return null; }
  window.__cipherscopeEvents = [];
  return buffer;
})()"#;

/// Evaluate the installer once. Returns whether this call patched the page.
pub async fn install(evaluator: &dyn PageEvaluator) -> bool {
    match evaluate_or_none(evaluator, INSTALLER).await {
        Some(Value::Bool(patched)) => {
            debug!(target: "correlator", patched, "capture agent install evaluated");
            patched
        }
        _ => {
            warn!(target: "correlator", "capture agent install produced no result");
            false
        }
    }
}

/// Drain the page buffer. Anything other than a non-empty array yields no events.
pub async fn drain(evaluator: &dyn PageEvaluator) -> Vec<PlainEvent> {
    match evaluate_or_none(evaluator, DRAIN_EXPRESSION).await {
        Some(Value::Array(items)) => decode_events(items),
        _ => Vec::new(),
    }
}

pub fn decode_events(items: Vec<Value>) -> Vec<PlainEvent> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<PlainEvent>(item) {
            Ok(event) => Some(event),
            Err(err) => {
                debug!(target: "correlator", %err, "dropping malformed plaintext event");
                None
            }
        })
        .collect()
}

/// Guarded call of a `window`-scoped function with one serialized argument.
///
/// The expression resolves to the function's (awaited) result, or `null` if the function is
/// missing, throws, rejects or returns `undefined`.
pub fn decrypt_expression(function: &str, candidate: &Value) -> String {
    let name = Value::String(function.to_string());
    format!(
        "(async function () {{\n  try {{\n    var fn = window[{name}];\n    if (typeof fn !== 'function') {{ return null; }}\n    var out = await fn({candidate});\n    return out === undefined ? null : out;\n  }} catch (_) {{\n    return null;\n  }}\n}})()"
    )
}
