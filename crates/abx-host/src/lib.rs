//! Host bridge facade: the [`AdBlocker`] type the embedding application
//! talks to.
//!
//! One `AdBlocker` owns one scripting environment running the filtering
//! payload. All methods are `&self` and thread-safe; the engine lock
//! serializes script entry. Script runtime errors never escape a facade
//! method: they are logged and the method degrades to its conservative
//! default (no match, not whitelisted, empty CSS).

mod filter;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use abx_engine::{CallArg, EngineError, Environment, JsSnapshot};
use abx_ipc::{CommandHandler, ControlFlags, ReportMessage, ReportSender};

pub use filter::{FilterKind, FilterResult};

/// How long to wait for the payload to signal readiness after
/// `initAdblock` returns.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates a blocker instance from the script payload, or `None` when the
/// payload cannot be brought up (bad script, missing entry point).
pub fn create_instance(script: &str) -> Option<AdBlocker> {
    match AdBlocker::new(script) {
        Ok(blocker) => Some(blocker),
        Err(err) => {
            log::error!("failed to create blocker instance: {err}");
            None
        }
    }
}

pub struct AdBlocker {
    env: Environment,
    first_run: bool,
    control: ControlFlags,
    reporter: Arc<ReportSender>,
}

impl AdBlocker {
    /// Brings up a blocker with the default control-flag and report
    /// locations.
    pub fn new(script: &str) -> Result<AdBlocker, EngineError> {
        Self::with_channels(script, ControlFlags::new(), ReportSender::new())
    }

    /// Brings up a blocker: evaluates the payload, registers the handlers
    /// for the events the payload raises (`init`, `BlockingHit`, download
    /// progress), calls `initAdblock` and waits (bounded) for the ready
    /// signal carrying the first-run flag.
    pub fn with_channels(
        script: &str,
        control: ControlFlags,
        reporter: ReportSender,
    ) -> Result<AdBlocker, EngineError> {
        let env = Environment::new()?;
        let reporter = Arc::new(reporter);
        let signal = Arc::new((Mutex::new(None::<bool>), Condvar::new()));
        let handler_signal = signal.clone();
        env.set_event_callback(
            "init",
            Arc::new(move |args: &[JsSnapshot]| {
                let first_run = args.first().map(JsSnapshot::truthy).unwrap_or(false);
                let (slot, cond) = &*handler_signal;
                let mut slot = slot.lock();
                if slot.is_none() {
                    *slot = Some(first_run);
                    cond.notify_all();
                }
            }),
        );
        let hit_reporter = reporter.clone();
        env.set_event_callback(
            "BlockingHit",
            Arc::new(move |args: &[JsSnapshot]| {
                // args: timestamp, website, location, rule
                let text = |index: usize| {
                    args.get(index)
                        .and_then(JsSnapshot::as_str)
                        .unwrap_or("")
                        .to_string()
                };
                let mut message = ReportMessage::new("block", text(1));
                if let Some(JsSnapshot::Number(ts)) = args.first() {
                    if *ts > 0.0 {
                        message.time = *ts as u64;
                    }
                }
                let location = text(2);
                if !location.is_empty() {
                    message = message.with_location(location);
                }
                let rule = text(3);
                if !rule.is_empty() {
                    message = message.with_rule(rule);
                }
                hit_reporter.send(&message);
            }),
        );
        env.set_event_callback(
            "downloadStart",
            Arc::new(|_args: &[JsSnapshot]| {
                log::info!("filter list download started");
            }),
        );
        env.set_event_callback(
            "downloadFinished",
            Arc::new(|_args: &[JsSnapshot]| {
                log::info!("filter list download finished");
            }),
        );
        env.evaluate(script, "adblock.js")?;
        env.call_entry("initAdblock", &[])?;
        let first_run = {
            let (slot, cond) = &*signal;
            let mut slot = slot.lock();
            if slot.is_none() {
                let _ = cond.wait_for(&mut slot, INIT_TIMEOUT);
            }
            match *slot {
                Some(first_run) => first_run,
                None => {
                    log::warn!("payload never signalled init; assuming not first run");
                    false
                }
            }
        };
        env.remove_event_callback("init");
        Ok(AdBlocker {
            env,
            first_run,
            control,
            reporter,
        })
    }

    pub fn is_first_run(&self) -> bool {
        self.first_run
    }

    /// The scripting environment behind this instance. Embedders may hook
    /// additional events on it.
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Asks the payload whether `url` matches a filter.
    pub fn check_filter_match(
        &self,
        url: &str,
        content_type: &str,
        parent_url: &str,
    ) -> FilterResult {
        match self.entry_snapshot(
            "API.checkFilterMatch",
            &[url.into(), content_type.into(), parent_url.into()],
        ) {
            Some(snapshot) => FilterResult::from_snapshot(&snapshot),
            None => FilterResult::NO_MATCH,
        }
    }

    /// Element-hiding selectors for a document on `domain`.
    pub fn element_hiding_selectors(&self, domain: &str) -> Vec<String> {
        match self.entry_snapshot("API.getElementHidingSelectors", &[domain.into()]) {
            Some(JsSnapshot::Json(json)) => serde_json::from_str(&json).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Whether `url` is whitelisted. The payload distinguishes call shapes
    /// by argument count, so empty `parent_url` and `content_type` are
    /// omitted from the call rather than passed as empty strings.
    pub fn is_whitelisted(&self, url: &str, parent_url: &str, content_type: &str) -> bool {
        let mut args: Vec<CallArg> = vec![url.into()];
        if !parent_url.is_empty() {
            args.push(parent_url.into());
            if !content_type.is_empty() {
                args.push(content_type.into());
            }
        }
        self.entry_snapshot("API.isWhitelisted", &args)
            .map(|snapshot| snapshot.truthy())
            .unwrap_or(false)
    }

    /// Toggles filtering globally (empty `domain`) or per-domain.
    pub fn toggle_enabled(&self, domain: &str, enabled: bool) {
        let _ = self.entry_snapshot("API.toggleEnabled", &[domain.into(), enabled.into()]);
    }

    /// The element-hiding stylesheet for the current filter state.
    pub fn generate_css_content(&self) -> String {
        match self.entry_snapshot("API.generateCSSContent", &[]) {
            Some(JsSnapshot::String(css)) => css,
            Some(other) => other.as_str().map(str::to_string).unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Subscribes the payload to an additional filter list.
    pub fn add_subscription(&self, url: &str) {
        let _ = self.entry_snapshot("API.addSubscription", &[url.into()]);
    }

    /// Emits a best-effort report to the host. Never enters the engine.
    pub fn report(&self, kind: &str, website: &str, location: Option<&str>, rule: Option<&str>) {
        let mut message = ReportMessage::new(kind, website);
        if let Some(location) = location {
            message = message.with_location(location);
        }
        if let Some(rule) = rule {
            message = message.with_rule(rule);
        }
        self.reporter.send(&message);
    }

    pub fn block_ads(&self) -> bool {
        self.control.block_ads()
    }

    pub fn block_malware(&self) -> bool {
        self.control.block_malware()
    }

    pub fn dont_track_me(&self) -> bool {
        self.control.dont_track_me()
    }

    /// Tears the instance down, joining all outstanding workers.
    pub fn dispose(self) {
        if let Err(err) = self.env.dispose() {
            log::warn!("dispose failed: {err}");
        }
    }

    fn entry_snapshot(&self, entry: &str, args: &[CallArg]) -> Option<JsSnapshot> {
        match self.env.call_entry(entry, args) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                log::warn!("{entry} failed: {err}");
                None
            }
        }
    }
}

impl CommandHandler for AdBlocker {
    fn set_enabled(&self, enabled: bool) {
        self.toggle_enabled("", enabled);
    }

    fn add_exception(&self, domain: &str) {
        // listing a domain as an exception turns filtering off for it
        self.toggle_enabled(domain, false);
    }

    fn remove_exception(&self, domain: &str) {
        self.toggle_enabled(domain, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    const STUB_API: &str = r#"
        var state = { enabled: true, exceptions: {}, subscriptions: [], lastWhitelistArgs: -1 };
        function initAdblock() { trigger('init', true); }
        var API = {
            checkFilterMatch: function (url, contentType, parentUrl) {
                if (!state.enabled || state.exceptions[parentUrl]) { return { kind: 'none' }; }
                if (url.indexOf('ads.') !== -1) { return { kind: 'blocking', collapse: false }; }
                if (url.indexOf('allow.') !== -1) { return { kind: 'whitelist' }; }
                return { kind: 'none' };
            },
            getElementHidingSelectors: function (domain) {
                return domain === 'example.com' ? ['#banner', '.ad'] : [];
            },
            isWhitelisted: function (url) {
                state.lastWhitelistArgs = arguments.length;
                return url === 'http://wl.example/';
            },
            lastWhitelistArgs: function () { return state.lastWhitelistArgs; },
            toggleEnabled: function (domain, enabled) {
                if (domain === '') { state.enabled = enabled; }
                else if (enabled) { delete state.exceptions[domain]; }
                else { state.exceptions[domain] = true; }
            },
            generateCSSContent: function () {
                return state.enabled ? '#banner { display: none; }' : '';
            },
            addSubscription: function (url) {
                state.subscriptions.push(url);
                trigger('subscriptionAdded', url);
            }
        };
    "#;

    fn blocker() -> AdBlocker {
        create_instance(STUB_API).expect("stub payload should come up")
    }

    #[test]
    fn full_facade_round_trip() {
        let blocker = blocker();
        assert!(blocker.is_first_run());

        let result = blocker.check_filter_match("http://ads.example/x.js", "script", "");
        assert_eq!(result.kind, FilterKind::Blocking);
        assert!(!result.collapse);

        let result = blocker.check_filter_match("http://allow.example/", "document", "");
        assert_eq!(result.kind, FilterKind::Whitelist);
        assert!(result.collapse, "missing collapse defaults to true");

        let result = blocker.check_filter_match("http://plain.example/", "script", "");
        assert_eq!(result, FilterResult::NO_MATCH);

        assert_eq!(
            blocker.element_hiding_selectors("example.com"),
            vec!["#banner".to_string(), ".ad".to_string()]
        );
        assert!(blocker.element_hiding_selectors("other.org").is_empty());

        assert!(blocker.is_whitelisted("http://wl.example/", "", ""));
        assert!(!blocker.is_whitelisted("http://other.example/", "", ""));

        assert_eq!(blocker.generate_css_content(), "#banner { display: none; }");

        blocker.toggle_enabled("", false);
        let result = blocker.check_filter_match("http://ads.example/x.js", "script", "");
        assert_eq!(result.kind, FilterKind::None);
        assert_eq!(blocker.generate_css_content(), "");

        blocker.dispose();
    }

    #[test]
    fn whitelist_call_shape_follows_argument_presence() {
        let blocker = blocker();
        let arg_count = |blocker: &AdBlocker| -> f64 {
            match blocker
                .environment()
                .call_entry("API.lastWhitelistArgs", &[])
                .unwrap()
            {
                JsSnapshot::Number(n) => n,
                other => panic!("unexpected snapshot {other:?}"),
            }
        };

        blocker.is_whitelisted("http://a/", "", "");
        assert_eq!(arg_count(&blocker), 1.0);

        blocker.is_whitelisted("http://a/", "http://parent/", "");
        assert_eq!(arg_count(&blocker), 2.0);

        blocker.is_whitelisted("http://a/", "http://parent/", "document");
        assert_eq!(arg_count(&blocker), 3.0);

        // no parent url means the type cannot be passed either
        blocker.is_whitelisted("http://a/", "", "document");
        assert_eq!(arg_count(&blocker), 1.0);
    }

    #[test]
    fn command_handler_maps_onto_toggle_enabled() {
        let blocker = blocker();
        blocker.set_enabled(false);
        assert_eq!(
            blocker
                .check_filter_match("http://ads.example/x.js", "script", "")
                .kind,
            FilterKind::None
        );
        blocker.set_enabled(true);
        assert!(blocker
            .check_filter_match("http://ads.example/x.js", "script", "")
            .is_blocking());

        blocker.add_exception("http://site.example/");
        assert_eq!(
            blocker
                .check_filter_match("http://ads.example/x.js", "script", "http://site.example/")
                .kind,
            FilterKind::None
        );
        blocker.remove_exception("http://site.example/");
        assert!(blocker
            .check_filter_match("http://ads.example/x.js", "script", "http://site.example/")
            .is_blocking());
    }

    #[test]
    fn script_errors_degrade_to_safe_defaults() {
        let script = r#"
            function initAdblock() { trigger('init', false); }
            var API = {
                checkFilterMatch: function () { throw new Error('broken payload'); },
                getElementHidingSelectors: function () { throw new Error('broken payload'); },
                isWhitelisted: function () { throw new Error('broken payload'); },
                generateCSSContent: function () { throw new Error('broken payload'); }
            };
        "#;
        let blocker = create_instance(script).expect("payload evaluates");
        assert!(!blocker.is_first_run());
        assert_eq!(
            blocker.check_filter_match("http://a/", "script", ""),
            FilterResult::NO_MATCH
        );
        assert!(blocker.element_hiding_selectors("example.com").is_empty());
        assert!(!blocker.is_whitelisted("http://a/", "", ""));
        assert_eq!(blocker.generate_css_content(), "");
    }

    #[test]
    fn missing_entry_point_is_fatal() {
        assert!(create_instance("var notTheApi = 1;").is_none());
        assert!(create_instance("syntax error here").is_none());
    }

    #[test]
    fn init_signal_may_arrive_from_a_worker() {
        let script = r#"
            function initAdblock() {
                setTimeout(function () { trigger('init', true); }, 10);
            }
        "#;
        let blocker = create_instance(script).expect("payload evaluates");
        assert!(blocker.is_first_run());
    }

    #[test]
    fn add_subscription_reaches_the_payload() {
        let blocker = blocker();
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        blocker.environment().set_event_callback(
            "subscriptionAdded",
            Arc::new(move |args: &[JsSnapshot]| {
                let _ = tx.lock().unwrap().send(args.to_vec());
            }),
        );
        blocker.add_subscription("http://lists.example/easylist.txt");
        let args = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            args,
            vec![JsSnapshot::String(
                "http://lists.example/easylist.txt".to_string()
            )]
        );
    }

    #[test]
    fn control_flags_come_from_the_shared_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let blocker = AdBlocker::with_channels(
            STUB_API,
            ControlFlags::at(&path),
            ReportSender::to(dir.path().join("report.sock")),
        )
        .unwrap();
        assert!(!blocker.block_ads());
        std::fs::write(&path, [1u8, 0, 1]).unwrap();
        assert!(blocker.block_ads());
        assert!(!blocker.block_malware());
        assert!(blocker.dont_track_me());
    }

    #[cfg(unix)]
    #[test]
    fn blocking_hit_events_become_reports() {
        use std::os::unix::net::UnixDatagram;
        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("report.sock");
        let receiver = UnixDatagram::bind(&report_path).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let blocker = AdBlocker::with_channels(
            STUB_API,
            ControlFlags::at(dir.path().join("control")),
            ReportSender::to(&report_path),
        )
        .unwrap();
        blocker
            .environment()
            .evaluate(
                "trigger('BlockingHit', 123456, 'http://ads.example/x.js',\n\
                 'http://site.example/', '||ads.example^');",
                "hit.js",
            )
            .unwrap();
        let mut buf = [0u8; 4096];
        let n = receiver.recv(&mut buf).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(std::str::from_utf8(&buf[..n]).unwrap()).unwrap();
        assert_eq!(parsed["type"], "block");
        assert_eq!(parsed["website"], "http://ads.example/x.js");
        assert_eq!(parsed["location"], "http://site.example/");
        assert_eq!(parsed["rule"], "||ads.example^");
        assert_eq!(parsed["time"], 123456);
    }

    #[test]
    fn concurrent_checks_stay_consistent() {
        let blocker = Arc::new(blocker());
        let mut joins = Vec::new();
        for i in 0..8 {
            let blocker = blocker.clone();
            joins.push(thread::spawn(move || {
                for _ in 0..25 {
                    if i % 2 == 0 {
                        let result =
                            blocker.check_filter_match("http://ads.example/x.js", "script", "");
                        assert_eq!(result.kind, FilterKind::Blocking);
                        assert!(!result.collapse);
                    } else {
                        let result =
                            blocker.check_filter_match("http://plain.example/", "script", "");
                        assert_eq!(result.kind, FilterKind::None);
                    }
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
    }
}
