//! Overlay Module Tests
//!
//! ## Test Scopes
//! - **NodeState**: splitting, merging, routing decisions and query fragmenting
//!   without any networking.
//! - **Service**: small overlays on loopback exercising joins, forwarding of
//!   stores and queries, departures and orphaned regions.
//! - **Failures**: dead and stalled skip-links, undeliverable answers and
//!   worker bookkeeping.

#[cfg(test)]
mod tests {
    use crate::config::NodeConfig;
    use crate::overlay::node::NodeState;
    use crate::overlay::service::OverlayService;
    use crate::overlay::types::{Address, Half, NodeId};
    use crate::protocol::answer::{merge_nearest, receive_answers, Answer};
    use crate::protocol::connection::Connection;
    use crate::protocol::description::NodeDescription;
    use crate::overlay::handlers;
    use crate::protocol::message::{Request, Tag};
    use crate::storage::types::{Entry, Key};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const TIMEOUT: Duration = Duration::from_secs(3);

    fn key(coords: &[f64]) -> Key {
        Key::new(coords.to_vec())
    }

    fn root_state() -> NodeState {
        NodeState::root(
            Address::new("hosta", 1),
            Key::splat(2, 0.0),
            Key::splat(2, 1.0),
        )
        .unwrap()
    }

    // ============================================================
    // NODE STATE TESTS
    // ============================================================

    #[test]
    fn test_node_ids() {
        let id = NodeId("0110".into());
        assert_eq!(id.sibling(), Some(NodeId("0111".into())));
        assert_eq!(NodeId::default().sibling(), None, "The root has no sibling");
        assert_eq!(id.common_prefix_len(&NodeId("0100".into())), 2);
        assert_eq!(
            id.halves(),
            vec![Half::Lower, Half::Upper, Half::Upper, Half::Lower]
        );
        assert!(NodeId::parse("01x").is_err());
    }

    #[test]
    fn test_split_halves_region_at_median() {
        let mut node = root_state();
        node.region_mut().update(key(&[0.2, 0.3]), b"x".to_vec()).unwrap();
        node.region_mut().update(key(&[0.8, 0.9]), b"y".to_vec()).unwrap();

        let sibling = node.split(Address::new("hostb", 2));

        assert_eq!(node.id(), NodeId("0".into()));
        assert_eq!(sibling.id(), NodeId("1".into()));
        assert_eq!(node.region().hi()[0], 0.2);
        assert_eq!(sibling.region().lo()[0], 0.2);
        assert_eq!(node.data_load(), 0);
        assert_eq!(sibling.data_load(), 2, "Keys on the boundary go to the upper half");
        assert_eq!(node.splits()[0].sibling, Address::new("hostb", 2));
        assert_eq!(sibling.splits()[0].sibling, Address::new("hosta", 1));
        assert!((node.volume_load() + sibling.volume_load() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_forward_to_picks_far_side() {
        let mut node = root_state();
        let mut sibling = node.split(Address::new("hostb", 2));
        assert_eq!(node.region().hi()[0], 0.5, "Empty regions split at the midpoint");

        assert_eq!(node.forward_to(&key(&[0.25, 0.9])), None);
        assert_eq!(node.forward_to(&key(&[0.5, 0.1])), Some(0));
        assert_eq!(sibling.forward_to(&key(&[0.49, 0.1])), Some(0));

        let grandchild = sibling.split(Address::new("hostc", 3));
        assert_eq!(sibling.id(), NodeId("10".into()));
        assert_eq!(grandchild.id(), NodeId("11".into()));
        assert_eq!(sibling.forward_to(&key(&[0.7, 0.7])), Some(1));
        assert_eq!(grandchild.forward_to(&key(&[0.1, 0.7])), Some(0));
        assert_eq!(grandchild.level_id(0), NodeId("0".into()));
        assert_eq!(grandchild.level_id(1), NodeId("10".into()));
    }

    #[test]
    fn test_split_then_merge_restores_node() {
        let mut node = root_state();
        for i in 0..20 {
            let x = i as f64 / 20.0;
            node.region_mut()
                .update(key(&[x, 1.0 - x - 0.01]), x.to_string().into_bytes())
                .unwrap();
        }

        let sibling = node.split(Address::new("hostb", 2));
        node.merge(sibling).unwrap();

        assert_eq!(node.depth(), 0);
        assert_eq!(node.region().lo(), &Key::splat(2, 0.0));
        assert_eq!(node.region().hi(), &Key::splat(2, 1.0));
        assert_eq!(node.data_load(), 20);
        assert!(node.region().tree().is_consistent());
    }

    #[test]
    fn test_lower_half_merges_into_upper() {
        let mut node = root_state();
        let mut sibling = node.split(Address::new("hostb", 2));
        sibling.merge(node).unwrap();
        assert_eq!(sibling.depth(), 0);
        assert_eq!(sibling.region().lo()[0], 0.0);
    }

    #[test]
    fn test_merge_rejects_mismatched_nodes() {
        let mut node = root_state();
        let mut sibling = node.split(Address::new("hostb", 2));
        let nephew = sibling.split(Address::new("hostc", 3));

        let err = node.merge(nephew).unwrap_err();
        assert!(err.to_string().contains("depths differ"), "Got: {}", err);

        let mut root = root_state();
        assert!(root.merge(root_state()).is_err(), "The root cannot merge");

        // Same depth but not adjacent on the split dimension.
        let mut left = root_state();
        let _right = left.split(Address::new("hostb", 2));
        let mut far = root_state();
        far.split(Address::new("hostd", 4));
        let err = left.merge_hi(far).unwrap_err();
        assert!(err.to_string().contains("does not abut"), "Got: {}", err);
        assert_eq!(left.depth(), 1, "A refused merge leaves the node untouched");
    }

    #[test]
    fn test_range_fragments_cover_outside_parts() {
        let mut node = root_state();
        node.split(Address::new("hostb", 2));
        node.split(Address::new("hostc", 3));
        // Node now owns [0, 0.5) x [0, 0.5).

        assert!(node
            .range_fragments(&key(&[0.1, 0.1]), &key(&[0.2, 0.2]))
            .is_empty());

        let fragments = node.range_fragments(&key(&[0.25, 0.25]), &key(&[0.75, 0.75]));
        let levels: Vec<usize> = fragments.iter().map(|f| f.level).collect();
        assert_eq!(levels, vec![0, 1]);

        assert_eq!(fragments[0].lo, key(&[0.5, 0.25]));
        assert_eq!(fragments[0].hi, key(&[0.75, 0.75]));

        assert_eq!(fragments[1].lo, key(&[0.25, 0.5]));
        assert_eq!(fragments[1].hi[1], 0.75);
        assert!(
            fragments[1].hi[0] < 0.5,
            "Points on the first boundary are already covered by level 0"
        );
    }

    #[test]
    fn test_range_fragment_beyond_boundary_stops_clipping() {
        let mut node = root_state();
        node.split(Address::new("hostb", 2));
        let fragments = node.range_fragments(&key(&[0.6, 0.1]), &key(&[0.9, 0.2]));
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].lo, key(&[0.6, 0.1]));
    }

    #[test]
    fn test_nearest_levels_honour_depth() {
        let mut node = root_state();
        node.split(Address::new("hostb", 2));
        node.split(Address::new("hostc", 3));
        let center = key(&[0.25, 0.25]);

        assert!(node.nearest_levels(&center, 0.1, 0).is_empty());
        assert_eq!(node.nearest_levels(&center, 0.3, 0), vec![0, 1]);
        assert_eq!(node.nearest_levels(&center, 0.3, 1), vec![1]);
        assert_eq!(node.nearest_levels(&key(&[0.45, 0.1]), 0.06, 0), vec![0]);
    }

    #[test]
    fn test_description_rebuilds_node() {
        let mut node = root_state();
        node.region_mut().update(key(&[0.6, 0.6]), b"v w".to_vec()).unwrap();
        node.region_mut().update(key(&[0.1, 0.6]), b"u".to_vec()).unwrap();
        let sibling = node.split(Address::new("hostb", 2));

        let text = sibling.describe(true).to_string();
        let rebuilt = NodeState::from_description(NodeDescription::parse(&text, 2).unwrap()).unwrap();
        assert_eq!(rebuilt.id(), sibling.id());
        assert_eq!(rebuilt.address(), sibling.address());
        assert_eq!(rebuilt.region().lo(), sibling.region().lo());
        assert_eq!(rebuilt.splits()[0].boundary, sibling.splits()[0].boundary);
        assert_eq!(
            rebuilt.region().lookup(&key(&[0.6, 0.6])),
            Some(&b"v w".to_vec())
        );
    }

    // ============================================================
    // SERVICE TESTS
    // ============================================================

    async fn start_node(config: NodeConfig) -> (Arc<OverlayService>, JoinHandle<()>) {
        let (service, listener) = OverlayService::start(&config).await.unwrap();
        let handle = tokio::spawn(service.clone().serve(listener));
        (service, handle)
    }

    async fn start_root() -> (Arc<OverlayService>, JoinHandle<()>) {
        start_node(NodeConfig::local(2)).await
    }

    async fn join(via: &OverlayService) -> (Arc<OverlayService>, JoinHandle<()>) {
        start_node(NodeConfig::local(2).joining(via.address())).await
    }

    async fn send(address: &Address, message: &str) -> String {
        let mut conn = Connection::open(address, TIMEOUT).await.unwrap();
        let reply = conn.request(message).await.unwrap();
        conn.close().await;
        reply
    }

    async fn put(node: &OverlayService, coords: &[f64], value: &str) {
        let message = Request::Insert {
            key: key(coords),
            value: value.as_bytes().to_vec(),
        };
        let reply = send(node.address(), &message.to_string()).await;
        assert_eq!(reply, "U OK", "Insert of ({:?}) failed", coords);
    }

    /// Sends a query built around a fresh reply address and collects answers.
    async fn ask(node: &OverlayService, build: impl FnOnce(Address) -> Request) -> (String, Vec<Answer>) {
        let sink = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reply = Address::new("127.0.0.1", sink.local_addr().unwrap().port());
        let ack = send(node.address(), &build(reply).to_string()).await;
        let answers = receive_answers(&sink, Duration::from_millis(300), TIMEOUT).await;
        (ack, answers)
    }

    async fn lookup(node: &OverlayService, coords: &[f64]) -> (String, Vec<Answer>) {
        ask(node, |reply| Request::Lookup {
            key: key(coords),
            reply,
            hops: 0,
        })
        .await
    }

    async fn stop(node: Arc<OverlayService>, handle: JoinHandle<()>) {
        node.shutdown();
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_join_splits_and_routes_lookups() {
        let (a, a_task) = start_root().await;
        put(&a, &[0.2, 0.3], "x").await;
        put(&a, &[0.8, 0.9], "y").await;

        let (b, b_task) = join(&a).await;
        assert_eq!(a.id().await, NodeId("0".into()));
        assert_eq!(b.id().await, NodeId("1".into()));
        assert_eq!(b.with_state(|s| s.data_load()).await, 2);

        let (ack, answers) = lookup(&a, &[0.8, 0.9]).await;
        assert_eq!(ack, "L OK");
        assert_eq!(answers.len(), 1, "Exactly one node answers a lookup");
        assert_eq!(answers[0].id, NodeId("1".into()));
        assert_eq!(answers[0].items[0].value, "y");
        assert_eq!(answers[0].hops, 2, "One hop at each node");

        let (_, answers) = lookup(&a, &[0.1, 0.1]).await;
        assert_eq!(answers[0].id, NodeId("0".into()));
        assert_eq!(answers[0].items[0].value, "", "A miss is reported as empty");

        let mut conn = Connection::open(b.address(), TIMEOUT).await.unwrap();
        conn.send("W\n").await.unwrap();
        let text = conn.recv_block().await.unwrap();
        let described = NodeDescription::parse(&text, 2).unwrap();
        assert_eq!(described.lo[0], 0.2);
        assert_eq!(described.siblings, vec![a.address().clone()]);
        assert!(described.entries.is_none(), "W omits data");

        stop(b, b_task).await;
        stop(a, a_task).await;
    }

    #[tokio::test]
    async fn test_append_concatenates_through_forwarding() {
        let (a, a_task) = start_root().await;
        put(&a, &[0.2, 0.3], "x").await;
        put(&a, &[0.8, 0.9], "y").await;
        let (b, b_task) = join(&a).await;

        for part in ["foo", "bar"] {
            let message = Request::Append {
                key: key(&[0.5, 0.5]),
                value: part.as_bytes().to_vec(),
            };
            assert_eq!(send(a.address(), &message.to_string()).await, "A OK");
        }

        let (_, answers) = lookup(&a, &[0.5, 0.5]).await;
        assert_eq!(answers[0].items[0].value, "foobar");
        assert_eq!(b.with_state(|s| s.data_load()).await, 3);

        put(&a, &[0.5, 0.5], "reset").await;
        let (_, answers) = lookup(&b, &[0.5, 0.5]).await;
        assert_eq!(answers[0].items[0].value, "reset", "Insert replaces");

        stop(b, b_task).await;
        stop(a, a_task).await;
    }

    #[tokio::test]
    async fn test_range_and_nearest_span_nodes() {
        let (a, a_task) = start_root().await;
        put(&a, &[0.2, 0.3], "x").await;
        put(&a, &[0.8, 0.9], "y").await;
        let (b, b_task) = join(&a).await;
        put(&a, &[0.1, 0.1], "a").await;
        put(&a, &[0.7, 0.7], "b").await;

        let (ack, answers) = ask(&a, |reply| Request::Range {
            lo: key(&[0.0, 0.0]),
            hi: key(&[1.0, 1.0]),
            reply,
            hops: 0,
        })
        .await;
        assert_eq!(ack, "R OK");
        let mut values: Vec<String> = answers
            .iter()
            .flat_map(|a| a.items.iter().map(|i| i.value.clone()))
            .collect();
        values.sort();
        assert_eq!(values, vec!["a", "b", "x", "y"]);

        let (ack, answers) = ask(&a, |reply| Request::Nearest {
            center: key(&[0.85, 0.85]),
            k: 3,
            radius: -1.0,
            reply,
            hops: 0,
            depth: 0,
        })
        .await;
        assert_eq!(ack, "N OK");
        let best: Vec<String> = merge_nearest(&answers, 3)
            .into_iter()
            .map(|i| i.value)
            .collect();
        assert_eq!(best, vec!["y", "b", "x"]);

        stop(b, b_task).await;
        stop(a, a_task).await;
    }

    #[tokio::test]
    async fn test_depart_merges_into_sibling() {
        let (a, a_task) = start_root().await;
        put(&a, &[0.2, 0.3], "x").await;
        put(&a, &[0.8, 0.9], "y").await;
        let (b, b_task) = join(&a).await;

        assert_eq!(send(b.address(), "Q\n").await, "Q OK");
        tokio::time::timeout(TIMEOUT, b_task).await.unwrap().unwrap();

        assert_eq!(a.id().await, NodeId::default(), "Survivor is the root again");
        assert_eq!(a.with_state(|s| s.data_load()).await, 2);

        let (ack, answers) = lookup(&a, &[0.8, 0.9]).await;
        assert_eq!(ack, "L OK");
        assert_eq!(answers[0].items[0].value, "y");
        assert_eq!(answers[0].hops, 1);

        stop(a, a_task).await;
    }

    #[tokio::test]
    async fn test_orphaned_region_served_then_handed_to_joiner() {
        let (a, a_task) = start_root().await;
        put(&a, &[0.1, 0.1], "a").await;
        put(&a, &[0.5, 0.5], "m").await;
        put(&a, &[0.9, 0.9], "z").await;
        let (b, b_task) = join(&a).await;
        let (c, c_task) = join(&b).await;
        assert_eq!(b.id().await, NodeId("10".into()));
        assert_eq!(c.id().await, NodeId("11".into()));

        // A's sibling B has split since, so it can only cache A's region.
        assert_eq!(send(a.address(), "Q\n").await, "Q OK");
        tokio::time::timeout(TIMEOUT, a_task).await.unwrap().unwrap();
        assert_eq!(b.with_state(|s| s.orphans().len()).await, 1);

        let (ack, answers) = lookup(&c, &[0.1, 0.1]).await;
        assert_eq!(ack, "L OK");
        assert_eq!(answers[0].id, NodeId("0".into()));
        assert_eq!(answers[0].host, b.address().to_string());
        assert_eq!(answers[0].items[0].value, "a");

        let (ack, answers) = ask(&b, |reply| Request::Nearest {
            center: key(&[0.1, 0.1]),
            k: 1,
            radius: -1.0,
            reply,
            hops: 0,
            depth: 0,
        })
        .await;
        assert_eq!(ack, "N OK", "The orphan stands in for the dead link");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].id, NodeId("0".into()));
        assert_eq!(merge_nearest(&answers, 1)[0].value, "a");

        let (d, d_task) = join(&b).await;
        assert_eq!(d.id().await, NodeId("0".into()), "Joiner adopts the orphan");
        assert_eq!(b.with_state(|s| s.orphans().len()).await, 0);

        let d_address = d.address().clone();
        let mut redirected = false;
        for _ in 0..50 {
            if c.with_state(|s| s.splits()[0].sibling == d_address).await {
                redirected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(redirected, "C should learn about D through an announcement");

        let (_, answers) = lookup(&c, &[0.1, 0.1]).await;
        assert_eq!(answers[0].host, d_address.to_string());
        assert_eq!(answers[0].items[0].value, "a");

        stop(d, d_task).await;
        stop(c, c_task).await;
        stop(b, b_task).await;
    }

    #[tokio::test]
    async fn test_malformed_request_closes_connection() {
        let (a, a_task) = start_root().await;
        let mut conn = Connection::open(a.address(), TIMEOUT).await.unwrap();
        conn.send("U(0.1)x\n").await.unwrap();
        assert_eq!(
            conn.recv_line().await.unwrap(),
            None,
            "Wrong arity is a protocol violation"
        );

        let message = Request::Insert {
            key: key(&[1.5, 0.5]),
            value: b"out".to_vec(),
        };
        assert_eq!(
            send(a.address(), &message.to_string()).await,
            "U BAD",
            "Keys outside the overlay are rejected"
        );

        stop(a, a_task).await;
    }

    #[tokio::test]
    async fn test_hop_count_saturates() {
        let (a, a_task) = start_root().await;
        put(&a, &[0.1, 0.1], "a").await;

        let (ack, answers) = ask(&a, |reply| Request::Lookup {
            key: key(&[0.1, 0.1]),
            reply,
            hops: u32::MAX,
        })
        .await;
        assert_eq!(ack, "L OK");
        assert_eq!(answers[0].hops, u32::MAX);

        stop(a, a_task).await;
    }

    // ============================================================
    // FAILURE TESTS
    // ============================================================

    /// Plays the owner of the upper half `[0.5, 1) x [0, 1)` for a node
    /// that joins through it. The joiner receives `(0.1,0.1) -> a`. Every
    /// request line arriving on a link is reported on the channel; with
    /// `stall_first_link` the first link never gets a reply.
    async fn upper_half_peer(stall_first_link: bool) -> (Address, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::new("127.0.0.1", listener.local_addr().unwrap().port());
        let (tx, rx) = mpsc::unbounded_channel();
        let own = address.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, TIMEOUT);
            let line = conn.recv_line().await.unwrap().unwrap();
            let joiner = match Request::parse(&line, None, 2).unwrap() {
                Request::Join { joiner } => joiner,
                other => panic!("Expected a join, got {:?}", other),
            };
            let description = NodeDescription {
                lo: Key::splat(2, 0.0),
                hi: key(&[0.5, 1.0]),
                address: joiner,
                id: NodeId("0".into()),
                boundaries: vec![0.5],
                siblings: vec![own],
                entries: Some(vec![Entry::new(key(&[0.1, 0.1]), b"a".to_vec())]),
            };
            conn.send(&description.to_string()).await.unwrap();
            assert_eq!(conn.recv_reply().await.unwrap(), "S OK");

            let mut accepted = 0;
            while let Ok((stream, _)) = listener.accept().await {
                let stall = stall_first_link && accepted == 0;
                accepted += 1;
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut conn = Connection::new(stream, TIMEOUT);
                    while let Ok(Some(line)) = conn.recv_line().await {
                        let _ = tx.send(line.clone());
                        if stall {
                            continue;
                        }
                        if let Ok(tag) = Tag::from_line(&line) {
                            let _ = conn.send(&tag.ok()).await;
                        }
                    }
                });
            }
        });

        (address, rx)
    }

    async fn next_forwarded(forwarded: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(TIMEOUT, forwarded.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dead_sibling_link_is_dropped() {
        let (a, a_task) = start_root().await;
        let (b, b_task) = join(&a).await;
        stop(b, b_task).await;

        let message = Request::Insert {
            key: key(&[0.8, 0.8]),
            value: b"lost".to_vec(),
        };
        assert_eq!(send(a.address(), &message.to_string()).await, "U BAD");
        assert!(
            a.with_state(|s| s.link(0).is_none()).await,
            "A failed transport marks the link dead"
        );

        let (ack, answers) = lookup(&a, &[0.8, 0.8]).await;
        assert_eq!(ack, "L BAD", "No orphan covers the dead subtree");
        assert!(answers.is_empty());

        let (ack, _) = lookup(&a, &[0.1, 0.1]).await;
        assert_eq!(ack, "L OK", "The local region is still served");

        stop(a, a_task).await;
    }

    #[tokio::test]
    async fn test_announcement_survives_a_dead_link() {
        let (a, a_task) = start_root().await;
        let (c, c_task) = join(&a).await;
        let (b, b_task) = join(&a).await;
        assert_eq!(a.id().await, NodeId("00".into()));
        assert_eq!(b.id().await, NodeId("01".into()));
        assert_eq!(c.id().await, NodeId("1".into()));
        stop(c, c_task).await;

        let newcomer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let newcomer_address = Address::new("127.0.0.1", newcomer.local_addr().unwrap().port());
        let description = NodeDescription {
            lo: key(&[0.5, 0.0]),
            hi: key(&[1.0, 0.5]),
            address: newcomer_address.clone(),
            id: NodeId("10".into()),
            boundaries: vec![0.5, 0.5],
            siblings: vec![a.address().clone(), a.address().clone()],
            entries: None,
        };

        let failed = handlers::announce(&a, description, 0).await;
        assert_eq!(failed, 1, "Only the link to the stopped node fails");
        assert!(a.with_state(|s| s.link(0).is_none()).await);
        assert!(
            b.with_state(|s| s.splits()[0].sibling == newcomer_address).await,
            "The live link still receives the announcement"
        );

        stop(b, b_task).await;
        stop(a, a_task).await;
    }

    #[tokio::test]
    async fn test_stalled_link_is_reopened() {
        let (peer, mut forwarded) = upper_half_peer(true).await;
        let mut config = NodeConfig::local(2).joining(&peer);
        config.receive_timeout_ms = 300;
        let (n, n_task) = start_node(config).await;
        assert_eq!(n.id().await, NodeId("0".into()));

        let first = Request::Insert {
            key: key(&[0.7, 0.7]),
            value: b"x".to_vec(),
        };
        assert_eq!(send(n.address(), &first.to_string()).await, "U BAD");
        assert_eq!(next_forwarded(&mut forwarded).await, "U(0.7,0.7)x");
        assert!(
            n.with_state(|s| s.link(0).is_some()).await,
            "A healthy sibling is linked again after a timeout"
        );

        let second = Request::Insert {
            key: key(&[0.7, 0.7]),
            value: b"y".to_vec(),
        };
        assert_eq!(send(n.address(), &second.to_string()).await, "U OK");
        assert_eq!(next_forwarded(&mut forwarded).await, "U(0.7,0.7)y");

        stop(n, n_task).await;
    }

    #[tokio::test]
    async fn test_range_fragments_sent_when_answer_is_undeliverable() {
        let (peer, mut forwarded) = upper_half_peer(false).await;
        let (n, n_task) = start_node(NodeConfig::local(2).joining(&peer)).await;
        assert_eq!(n.with_state(|s| s.data_load()).await, 1);

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let nowhere = Address::new("127.0.0.1", closed.local_addr().unwrap().port());
        drop(closed);

        let query = Request::Range {
            lo: Key::splat(2, 0.0),
            hi: Key::splat(2, 1.0),
            reply: nowhere,
            hops: 0,
        };
        assert_eq!(
            send(n.address(), &query.to_string()).await,
            "R BAD",
            "The lost local answer is still reported"
        );
        let fragment = next_forwarded(&mut forwarded).await;
        assert!(fragment.starts_with("R((0.5,0),(1,1))"), "Got: {}", fragment);

        stop(n, n_task).await;
    }

    #[tokio::test]
    async fn test_panicking_worker_leaves_registry() {
        let (a, a_task) = start_root().await;
        a.spawn_tracked(async { panic!("worker failure") });

        let mut drained = false;
        for _ in 0..50 {
            if a.active_workers() == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(drained, "Finished workers must not linger in the registry");

        stop(a, a_task).await;
    }

    #[test]
    fn test_config_validation() {
        assert!(NodeConfig::local(2).validate().is_ok());
        assert!(NodeConfig::local(0).validate().is_err());
        assert!(NodeConfig::local(9).validate().is_err());

        let mut config = NodeConfig::local(2);
        config.low = 1.0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::local(2);
        config.remote = Some("localhost".into());
        assert!(config.validate().is_err(), "A remote needs a port");

        let mut config = NodeConfig::local(2);
        config.ipv6 = true;
        assert_eq!(config.host(), "::1");
    }
}
