//! Domain Classifier: orchestrates the five signals into a verdict.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::catalog::CatalogSource;
use crate::doh::DohResolver;
use crate::domain;
use crate::error::ClassifyError;
use crate::geoip::GeoLookup;
use crate::rule_store::RuleStore;

/// Outcome of a classification, carrying the five boolean signals that
/// led to it alongside the decision itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub second_level_domain: String,
    pub domain_in_geosite: bool,
    pub registered_in_geosite: bool,
    pub ip_is_china: bool,
    pub registered_ip_is_china: bool,
    pub ns_is_china: bool,
    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Add { target: String },
    AlreadyCovered { reason: String },
    Reject { reason: String },
    Error { reason: String },
}

impl Verdict {
    fn error(reason: impl Into<String>) -> Self {
        Self {
            second_level_domain: String::new(),
            domain_in_geosite: false,
            registered_in_geosite: false,
            ip_is_china: false,
            registered_ip_is_china: false,
            ns_is_china: false,
            decision: Decision::Error { reason: reason.into() },
        }
    }

    fn already_covered(registered: &str, reason: impl Into<String>) -> Self {
        Self {
            second_level_domain: registered.to_string(),
            domain_in_geosite: false,
            registered_in_geosite: false,
            ip_is_china: false,
            registered_ip_is_china: false,
            ns_is_china: false,
            decision: Decision::AlreadyCovered { reason: reason.into() },
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self.decision, Decision::Add { .. })
    }
}

/// Orchestrates the Normalizer, Rule Store, GeoSite, DoH pools and GeoIP
/// lookup into a single `classify` call.
pub struct Classifier {
    rule_store: Arc<dyn RuleStore>,
    doh_a: Arc<dyn DohResolver>,
    doh_ns: Arc<dyn DohResolver>,
    catalogs: Arc<dyn CatalogSource>,
}

impl Classifier {
    pub fn new(
        rule_store: Arc<dyn RuleStore>,
        doh_a: Arc<dyn DohResolver>,
        doh_ns: Arc<dyn DohResolver>,
        catalogs: Arc<dyn CatalogSource>,
    ) -> Self {
        Self {
            rule_store,
            doh_a,
            doh_ns,
            catalogs,
        }
    }

    /// Classify with no cancellation source — equivalent to
    /// `classify_cancellable` with a token that is never cancelled.
    pub async fn classify(&self, input_text: &str) -> Verdict {
        self.classify_cancellable(input_text, &CancellationToken::new()).await
    }

    /// Classify, racing the whole operation against `cancel`. If `cancel`
    /// fires before the verdict is ready, in-flight DoH requests are
    /// dropped (best-effort — the underlying pool races are cancelled by
    /// being polled no further) and the verdict surfaces `error`, per
    /// §5's "calling context cancelled" contract.
    pub async fn classify_cancellable(&self, input_text: &str, cancel: &CancellationToken) -> Verdict {
        tokio::select! {
            verdict = self.run_classify(input_text) => verdict,
            () = cancel.cancelled() => Verdict::error(ClassifyError::Cancelled.to_string()),
        }
    }

    async fn run_classify(&self, input_text: &str) -> Verdict {
        let normalized = match domain::extract_one(input_text) {
            Some(n) => n,
            None => return Verdict::error("no valid domain found"),
        };

        if normalized.is_cn {
            return Verdict::already_covered(&normalized.registered_domain, "cn domain, default direct");
        }

        let domain = normalized.input_domain.as_str();
        let registered = normalized.registered_domain.as_str();

        let membership = match self.rule_store.contains(domain).await {
            Ok(m) => m,
            Err(e) => return Verdict::error(e.to_string()),
        };
        if membership.covered {
            return Verdict::already_covered(registered, "rule exists");
        }

        // Catalogs are snapshotted once and reused for the rest of this
        // request so a concurrent refresh never mixes generations.
        let catalogs = self.catalogs.snapshot();
        let domain_in_geosite = catalogs.geosite.matches(domain);
        let registered_in_geosite = catalogs.geosite.matches(registered);
        if domain_in_geosite || registered_in_geosite {
            let mut v = Verdict::already_covered(registered, "covered by geosite");
            v.domain_in_geosite = domain_in_geosite;
            v.registered_in_geosite = registered_in_geosite;
            return v;
        }

        let resolve_registered = domain != registered;
        let (domain_ips, ns_names, registered_ips) = tokio::join!(
            self.doh_a.resolve_a(domain),
            self.doh_ns.resolve_ns(domain),
            async {
                if resolve_registered {
                    self.doh_a.resolve_a(registered).await
                } else {
                    Vec::new()
                }
            }
        );

        let ip_is_china = any_is_china(catalogs.geoip.as_ref(), &domain_ips);
        let registered_ip_is_china = if resolve_registered {
            any_is_china(catalogs.geoip.as_ref(), &registered_ips)
        } else {
            ip_is_china
        };
        let ns_is_china = self.any_ns_is_china(catalogs.geoip.as_ref(), &ns_names).await;

        let decision = if ns_is_china {
            Decision::Reject {
                reason: "ns in CN suggests already reachable via CN".to_string(),
            }
        } else if ip_is_china || registered_ip_is_china {
            Decision::Add {
                target: registered.to_string(),
            }
        } else {
            Decision::Reject {
                reason: "not a CN-hosted service".to_string(),
            }
        };

        Verdict {
            second_level_domain: registered.to_string(),
            domain_in_geosite,
            registered_in_geosite,
            ip_is_china,
            registered_ip_is_china,
            ns_is_china,
            decision,
        }
    }

    /// For each NS name, resolve it through the A-pool and test its first
    /// responsive IP. Any NS landing in China makes the whole check true.
    async fn any_ns_is_china(&self, geoip: &dyn GeoLookup, ns_names: &[String]) -> bool {
        for ns in ns_names {
            let ips = self.doh_a.resolve_a(ns).await;
            if let Some(first) = ips.first() {
                if geoip.is_china(*first) {
                    return true;
                }
            }
        }
        false
    }

    /// Thin pass-through to the Rule Store for a verdict already decided
    /// as `add`.
    pub async fn confirm_add(&self, verdict: &Verdict, author_identity: &str) -> Result<String, ClassifyError> {
        match &verdict.decision {
            Decision::Add { target } => self.rule_store.append(target, author_identity).await,
            _ => Err(ClassifyError::InputInvalid),
        }
    }
}

fn any_is_china(geoip: &dyn GeoLookup, ips: &[Ipv4Addr]) -> bool {
    ips.iter().any(|ip| geoip.is_china(*ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalogs;
    use crate::geoip::{CnIpv4Index, GeoIp};
    use crate::geosite::GeoSiteCatalog;
    use crate::rule_store::InMemoryRuleStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FixedCatalogs(Catalogs);
    impl CatalogSource for FixedCatalogs {
        fn snapshot(&self) -> Catalogs {
            self.0.clone()
        }
    }

    /// DoH stand-in keyed by domain name, entirely in memory.
    #[derive(Default)]
    struct StubResolver {
        a: HashMap<String, Vec<Ipv4Addr>>,
        ns: HashMap<String, Vec<String>>,
        calls: StdMutex<u32>,
    }

    impl StubResolver {
        fn with_a(mut self, domain: &str, ips: Vec<Ipv4Addr>) -> Self {
            self.a.insert(domain.to_string(), ips);
            self
        }
        fn with_ns(mut self, domain: &str, names: Vec<&str>) -> Self {
            self.ns.insert(domain.to_string(), names.into_iter().map(String::from).collect());
            self
        }
    }

    #[async_trait]
    impl DohResolver for StubResolver {
        async fn resolve_a(&self, domain: &str) -> Vec<Ipv4Addr> {
            *self.calls.lock().unwrap() += 1;
            self.a.get(domain).cloned().unwrap_or_default()
        }
        async fn resolve_ns(&self, domain: &str) -> Vec<String> {
            self.ns.get(domain).cloned().unwrap_or_default()
        }
    }

    fn empty_catalogs() -> Arc<dyn CatalogSource> {
        Arc::new(FixedCatalogs(Catalogs::new(
            Arc::new(GeoIp::empty()),
            Arc::new(GeoSiteCatalog::default()),
        )))
    }

    fn cn_geoip(cidr: &str) -> Arc<GeoIp> {
        Arc::new(GeoIp::new(None, CnIpv4Index::parse(cidr)))
    }

    #[tokio::test]
    async fn cn_tld_short_circuits_without_doh_calls() {
        let a = Arc::new(StubResolver::default());
        let ns = Arc::new(StubResolver::default());
        let classifier = Classifier::new(
            Arc::new(InMemoryRuleStore::new()),
            a.clone(),
            ns,
            empty_catalogs(),
        );
        let v = classifier.classify("www.example.cn").await;
        assert!(matches!(v.decision, Decision::AlreadyCovered { .. }));
        assert_eq!(*a.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn china_a_record_yields_add_with_registered_target() {
        // NS resolution lands on a non-CN IP, so only the A-record signal
        // should drive the decision.
        let a_pool = StubResolver::default()
            .with_a("sub.foo.com", vec!["1.1.1.1".parse().unwrap()])
            .with_a("foo.com", vec!["1.1.1.1".parse().unwrap()])
            .with_a("ns1.bar.net", vec!["8.8.8.8".parse().unwrap()]);
        let ns_pool = StubResolver::default().with_ns("sub.foo.com", vec!["ns1.bar.net"]);
        let geoip = cn_geoip("1.1.1.1/32");
        let catalogs = Arc::new(FixedCatalogs(Catalogs::new(geoip, Arc::new(GeoSiteCatalog::default()))));

        let classifier = Classifier::new(
            Arc::new(InMemoryRuleStore::new()),
            Arc::new(a_pool),
            Arc::new(ns_pool),
            catalogs,
        );
        let v = classifier.classify("https://sub.foo.com/path").await;
        assert_eq!(
            v.decision,
            Decision::Add {
                target: "foo.com".to_string()
            }
        );
        assert!(v.ip_is_china);
        assert!(!v.ns_is_china);
    }

    #[tokio::test]
    async fn china_ns_record_yields_reject_even_with_china_ip() {
        // The NS name itself resolves (via the A-pool) to a CN IP, which
        // must force a reject regardless of the domain's own CN A-record.
        let a_pool = StubResolver::default()
            .with_a("sub.foo.com", vec!["1.1.1.1".parse().unwrap()])
            .with_a("foo.com", vec!["1.1.1.1".parse().unwrap()])
            .with_a("ns1.bar.net", vec!["114.114.114.114".parse().unwrap()]);
        let ns_pool = StubResolver::default().with_ns("sub.foo.com", vec!["ns1.bar.net"]);
        let geoip = cn_geoip("1.1.1.1/32\n114.114.114.114/32");
        let catalogs = Arc::new(FixedCatalogs(Catalogs::new(geoip, Arc::new(GeoSiteCatalog::default()))));

        let classifier = Classifier::new(
            Arc::new(InMemoryRuleStore::new()),
            Arc::new(a_pool),
            Arc::new(ns_pool),
            catalogs,
        );
        let v = classifier.classify("https://sub.foo.com/path").await;
        assert!(matches!(v.decision, Decision::Reject { .. }));
        assert!(v.ns_is_china);
    }

    #[tokio::test]
    async fn non_china_everything_yields_reject() {
        let a = StubResolver::default().with_a("plain.example.net", vec!["8.8.8.8".parse().unwrap()]);
        let classifier = Classifier::new(
            Arc::new(InMemoryRuleStore::new()),
            Arc::new(a),
            Arc::new(StubResolver::default()),
            empty_catalogs(),
        );
        let v = classifier.classify("plain.example.net").await;
        assert_eq!(
            v.decision,
            Decision::Reject {
                reason: "not a CN-hosted service".to_string()
            }
        );
    }

    #[tokio::test]
    async fn geosite_keyword_short_circuits_before_dns() {
        let a = Arc::new(StubResolver::default());
        let catalogs = Arc::new(FixedCatalogs(Catalogs::new(
            Arc::new(GeoIp::empty()),
            Arc::new(GeoSiteCatalog::parse("keyword:tencent\n")),
        )));
        let classifier = Classifier::new(
            Arc::new(InMemoryRuleStore::new()),
            a.clone(),
            Arc::new(StubResolver::default()),
            catalogs,
        );
        let v = classifier.classify("cdn.tencentyun.com").await;
        assert!(matches!(v.decision, Decision::AlreadyCovered { .. }));
        assert_eq!(*a.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn rule_store_hit_short_circuits_before_geosite_and_dns() {
        let a = Arc::new(StubResolver::default());
        let store = Arc::new(InMemoryRuleStore::with_lines(["foo.com".to_string()]));
        let classifier = Classifier::new(store, a.clone(), Arc::new(StubResolver::default()), empty_catalogs());
        let v = classifier.classify("sub.foo.com").await;
        assert!(matches!(v.decision, Decision::AlreadyCovered { .. }));
        assert_eq!(*a.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_input_is_an_error_verdict() {
        let classifier = Classifier::new(
            Arc::new(InMemoryRuleStore::new()),
            Arc::new(StubResolver::default()),
            Arc::new(StubResolver::default()),
            empty_catalogs(),
        );
        let v = classifier.classify("no domain in this text").await;
        assert!(matches!(v.decision, Decision::Error { .. }));
    }

    #[tokio::test]
    async fn confirm_add_appends_to_the_rule_store() {
        let store = Arc::new(InMemoryRuleStore::new());
        let a = StubResolver::default().with_a("plain.example.net", vec!["114.114.114.114".parse().unwrap()]);
        let geoip = cn_geoip("114.114.114.114/32");
        let catalogs = Arc::new(FixedCatalogs(Catalogs::new(geoip, Arc::new(GeoSiteCatalog::default()))));
        let classifier = Classifier::new(store.clone(), Arc::new(a), Arc::new(StubResolver::default()), catalogs);

        let v = classifier.classify("plain.example.net").await;
        assert!(v.is_add());
        let commit = classifier.confirm_add(&v, "bot@example.org").await.unwrap();
        assert!(!commit.is_empty());
        assert!(store.contains("plain.example.net").await.unwrap().covered);
    }

    /// A-pool resolver that sleeps before answering, so a cancellation
    /// raised before the sleep elapses always wins the race.
    #[derive(Default)]
    struct SlowResolver;
    #[async_trait]
    impl DohResolver for SlowResolver {
        async fn resolve_a(&self, _domain: &str) -> Vec<Ipv4Addr> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            vec!["1.1.1.1".parse().unwrap()]
        }
        async fn resolve_ns(&self, _domain: &str) -> Vec<String> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Vec::new()
        }
    }

    #[tokio::test]
    async fn cancellation_before_doh_resolution_surfaces_an_error_verdict() {
        let classifier = Classifier::new(
            Arc::new(InMemoryRuleStore::new()),
            Arc::new(SlowResolver),
            Arc::new(SlowResolver),
            empty_catalogs(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let v = classifier.classify_cancellable("plain.example.net", &cancel).await;
        match v.decision {
            Decision::Error { reason } => assert!(reason.contains("cancelled")),
            other => panic!("expected a cancelled error verdict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn uncancelled_token_behaves_like_plain_classify() {
        let classifier = Classifier::new(
            Arc::new(InMemoryRuleStore::new()),
            Arc::new(StubResolver::default()),
            Arc::new(StubResolver::default()),
            empty_catalogs(),
        );
        let cancel = CancellationToken::new();
        let v = classifier.classify_cancellable("plain.example.net", &cancel).await;
        assert!(matches!(v.decision, Decision::Reject { .. }));
    }
}
