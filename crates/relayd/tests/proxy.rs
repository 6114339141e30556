//! End-to-end tests driving a real listener against stub upstreams.

mod common;

use std::time::Duration;

use common::{start_proxy, upstream};
use relayd::http::StatusCode;
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_distributes_evenly() {
	let a = upstream("a", Duration::ZERO).await;
	let b = upstream("b", Duration::ZERO).await;
	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pool": "p"}],
		"pools": {"p": {"endpoints": [a.endpoint(), b.endpoint()]}}
	}))
	.await;

	for _ in 0..100 {
		let (status, _) = proxy.get("/").await;
		assert_eq!(status, StatusCode::OK);
	}
	// Strict alternation from the round-robin counter.
	assert_eq!(a.hits(), 50);
	assert_eq!(b.hits(), 50);
}

#[tokio::test(flavor = "multi_thread")]
async fn no_route_is_404() {
	let a = upstream("a", Duration::ZERO).await;
	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pathPrefix": "/api", "pool": "p"}],
		"pools": {"p": {"endpoints": [a.endpoint()]}}
	}))
	.await;
	let (status, _) = proxy.get("/other").await;
	assert_eq!(status, StatusCode::NOT_FOUND);
	let (status, _) = proxy.get("/api/x").await;
	assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_id_is_echoed_and_generated() {
	let a = upstream("a", Duration::ZERO).await;
	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pool": "p"}],
		"pools": {"p": {"endpoints": [a.endpoint()]}}
	}))
	.await;
	let id = proxy.response_header("/", "x-request-id").await.unwrap();
	assert_eq!(id.len(), 32);
}

#[tokio::test(flavor = "multi_thread")]
async fn outlier_ejection_diverts_and_expires() {
	let good = upstream("good", Duration::ZERO).await;
	let bad = upstream("bad", Duration::ZERO).await;
	bad.fail.store(true, std::sync::atomic::Ordering::SeqCst);

	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pool": "p"}],
		"pools": {"p": {
			"endpoints": [good.endpoint(), bad.endpoint()],
			"outlier": {"consecutiveFailures": 3, "baseEjectMs": 300, "maxEjectMs": 2000},
			// Keep passive local ejection out of this test's way.
			"health": {"passiveFailureThreshold": 100}
		}}
	}))
	.await;

	// Drive traffic until the bad endpoint accumulates three consecutive
	// failures and is ejected.
	for _ in 0..6 {
		let _ = proxy.get("/").await;
	}
	let bad_before = bad.hits();
	assert!(bad_before >= 3);

	// While ejected, everything lands on the good endpoint.
	for _ in 0..10 {
		let (status, body) = proxy.get("/").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "good");
	}
	assert_eq!(bad.hits(), bad_before);

	// After the ejection expires the endpoint is picked again.
	tokio::time::sleep(Duration::from_millis(350)).await;
	for _ in 0..4 {
		let _ = proxy.get("/").await;
	}
	assert!(bad.hits() > bad_before);
}

#[tokio::test(flavor = "multi_thread")]
async fn breaker_opens_rejects_and_recovers_via_probe() {
	let ep = upstream("x", Duration::ZERO).await;
	ep.fail.store(true, std::sync::atomic::Ordering::SeqCst);

	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pool": "p"}],
		"pools": {"p": {
			"endpoints": [ep.endpoint()],
			"breaker": {"minRequests": 5, "failureRatePercent": 60,
				"evaluationWindowMs": 10000, "openDurationMs": 500, "halfOpenMaxProbes": 1},
			"outlier": {"consecutiveFailures": 1000},
			"health": {"passiveFailureThreshold": 1000}
		}}
	}))
	.await;

	for _ in 0..5 {
		let (status, _) = proxy.get("/").await;
		assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
	}
	// Open: rejected locally, upstream untouched.
	let before = ep.hits();
	for _ in 0..5 {
		let (status, _) = proxy.get("/").await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
	}
	assert_eq!(ep.hits(), before);

	// After the open window a single successful probe closes the circuit.
	ep.fail.store(false, std::sync::atomic::Ordering::SeqCst);
	tokio::time::sleep(Duration::from_millis(550)).await;
	let (status, _) = proxy.get("/").await;
	assert_eq!(status, StatusCode::OK);
	let (status, _) = proxy.get("/").await;
	assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_recovers_from_a_failing_endpoint() {
	let bad = upstream("bad", Duration::ZERO).await;
	bad.fail.store(true, std::sync::atomic::Ordering::SeqCst);
	let good = upstream("good", Duration::ZERO).await;

	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pool": "p", "policy": {
			"retry": {"maxAttempts": 2, "retryOn": ["5xx"], "backoffBaseMs": 1, "jitterMs": 1}
		}}],
		"pools": {"p": {
			"endpoints": [bad.endpoint(), good.endpoint()],
			"health": {"passiveFailureThreshold": 1000},
			"outlier": {"consecutiveFailures": 1000},
			"breaker": {"minRequests": 1000}
		}}
	}))
	.await;

	// First attempt hits the failing endpoint, the retry lands on the good
	// one; the client only ever sees 200.
	for _ in 0..5 {
		let (status, body) = proxy.get("/").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "good");
	}
	assert!(bad.hits() > 0);
	assert!(good.hits() >= 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_hits_and_coalesces_concurrent_misses() {
	let origin = upstream("cached-body", Duration::from_millis(150)).await;
	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pool": "p", "policy": {
			"cache": {"ttlMs": 30000}
		}}],
		"pools": {"p": {"endpoints": [origin.endpoint()]}}
	}))
	.await;

	// Miss then hit.
	let (status, body) = proxy.get("/a").await;
	assert_eq!((status, body.as_ref()), (StatusCode::OK, b"cached-body".as_ref()));
	let (status, _) = proxy.get("/a").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(origin.hits(), 1);

	// Ten parallel misses on a fresh path collapse to one origin fetch.
	let mut handles = Vec::new();
	for _ in 0..10 {
		let client = proxy.client();
		let addr = proxy.addr;
		handles.push(tokio::spawn(async move {
			let req = ::http::Request::builder()
				.method(::http::Method::GET)
				.uri("/fresh")
				.body(relayd::http::Body::empty())
				.unwrap();
			let resp = client.call(req, addr, Some(Duration::from_secs(5))).await.unwrap();
			let (parts, body) = resp.into_parts();
			(parts.status, body.collect_up_to(1 << 20).await.unwrap())
		}));
	}
	let mut bodies = Vec::new();
	for h in handles {
		let (status, body) = h.await.unwrap();
		assert_eq!(status, StatusCode::OK);
		bodies.push(body);
	}
	assert!(bodies.iter().all(|b| b == &bodies[0]));
	assert_eq!(origin.hits(), 2, "exactly one fetch per distinct path");
}

#[tokio::test(flavor = "multi_thread")]
async fn post_requests_bypass_the_cache() {
	let origin = upstream("body", Duration::ZERO).await;
	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pool": "p", "policy": {"cache": {"ttlMs": 30000}}}],
		"pools": {"p": {"endpoints": [origin.endpoint()]}}
	}))
	.await;
	for _ in 0..3 {
		let (status, _) = proxy.request(::http::Method::POST, "/a", &[]).await;
		assert_eq!(status, StatusCode::OK);
	}
	assert_eq!(origin.hits(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn canary_cohorts_split_between_pools() {
	let stable = upstream("stable", Duration::ZERO).await;
	let canary = upstream("canary", Duration::ZERO).await;
	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pool": "stable", "policy": {
			"traffic": {"stableWeight": 50, "canaryWeight": 50,
				"canaryPool": "canary", "cohortHeader": "x-user"}
		}}],
		"pools": {
			"stable": {"endpoints": [stable.endpoint()]},
			"canary": {"endpoints": [canary.endpoint()]}
		}
	}))
	.await;

	let mut stable_seen = 0;
	let mut canary_seen = 0;
	for i in 0..60 {
		let user = format!("user-{i}");
		let (status, body) = proxy
			.request(::http::Method::GET, "/", &[("x-user", &user)])
			.await;
		assert_eq!(status, StatusCode::OK);
		match body.as_ref() {
			b"stable" => stable_seen += 1,
			b"canary" => canary_seen += 1,
			other => panic!("unexpected body {other:?}"),
		}
		// The same cohort key is sticky.
		let (_, again) = proxy
			.request(::http::Method::GET, "/", &[("x-user", &user)])
			.await;
		assert_eq!(again, body);
	}
	assert!(stable_seen > 10, "stable share: {stable_seen}");
	assert!(canary_seen > 10, "canary share: {canary_seen}");
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_completes_inflight_requests() {
	let slow = upstream("done", Duration::from_millis(300)).await;
	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pool": "p"}],
		"pools": {"p": {"endpoints": [slow.endpoint()]}},
		"shutdown": {"gracefulTimeoutMs": 5000}
	}))
	.await;

	let mut handles = Vec::new();
	for _ in 0..10 {
		let client = proxy.client();
		let addr = proxy.addr;
		handles.push(tokio::spawn(async move {
			let req = ::http::Request::builder()
				.method(::http::Method::GET)
				.uri("/")
				.body(relayd::http::Body::empty())
				.unwrap();
			let resp = client.call(req, addr, Some(Duration::from_secs(5))).await?;
			let (parts, body) = resp.into_parts();
			body.collect_up_to(1 << 20).await.map_err(|_| {
				relayd::proxy::ProxyError::UpstreamTimeout
			})?;
			Ok::<_, relayd::proxy::ProxyError>(parts.status)
		}));
	}
	// Let the requests reach the upstream before draining.
	tokio::time::sleep(Duration::from_millis(100)).await;
	let addr = proxy.addr;
	proxy.shutdown().await;

	// Every in-flight request completed despite the shutdown.
	for h in handles {
		assert_eq!(h.await.unwrap().unwrap(), StatusCode::OK);
	}
	// And the listener is gone.
	assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_swap_does_not_disturb_inflight_requests() {
	let slow = upstream("old-pool", Duration::from_millis(300)).await;
	let fast = upstream("new-pool", Duration::ZERO).await;
	let proxy = start_proxy(json!({
		"routes": [{"id": "r", "pool": "p"}],
		"pools": {"p": {"endpoints": [slow.endpoint()]}}
	}))
	.await;

	// Start a request against the old snapshot.
	let client = proxy.client();
	let addr = proxy.addr;
	let inflight = tokio::spawn(async move {
		let req = ::http::Request::builder()
			.method(::http::Method::GET)
			.uri("/")
			.body(relayd::http::Body::empty())
			.unwrap();
		let resp = client.call(req, addr, Some(Duration::from_secs(5))).await.unwrap();
		let (parts, body) = resp.into_parts();
		(parts.status, body.collect_up_to(1 << 20).await.unwrap())
	});
	tokio::time::sleep(Duration::from_millis(100)).await;

	// Swap in a config that points the pool elsewhere.
	let next = json!({
		"routes": [{"id": "r", "pool": "p"}],
		"pools": {"p": {"endpoints": [fast.endpoint()]}}
	});
	proxy
		.app
		.apply
		.apply_bytes(
			&serde_json::to_vec(&next).unwrap(),
			relayd::strng::literal!("swap"),
			relayd::apply::Mode::Apply,
		)
		.await
		.unwrap();

	// The in-flight request still completes against the old endpoint.
	let (status, body) = inflight.await.unwrap();
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, "old-pool");

	// New requests land on the new endpoint.
	let (_, body) = proxy.get("/").await;
	assert_eq!(body, "new-pool");
}
