//! Protocol Module Tests
//!
//! ## Test Scopes
//! - **Messages**: parsing of every request shape and rejection of malformed lines.
//! - **Descriptions**: parsing of root and split descriptions, with and without data.
//! - **Answers**: answer blocks, lookup misses and merging of nearest-neighbour results.
//! - **Connection**: framing and reply timeouts over a loopback socket.

#[cfg(test)]
mod tests {
    use crate::overlay::types::{Address, NodeId};
    use crate::protocol::answer::{merge_nearest, Answer, AnswerItem};
    use crate::protocol::connection::Connection;
    use crate::protocol::description::NodeDescription;
    use crate::protocol::message::{Request, Tag};
    use crate::storage::types::{Entry, Key};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    fn key(coords: &[f64]) -> Key {
        Key::new(coords.to_vec())
    }

    // ============================================================
    // MESSAGE TESTS
    // ============================================================

    #[test]
    fn test_parse_insert_keeps_raw_value() {
        let req = Request::parse("U(0.2,0.3)hello world", None, 2).unwrap();
        match req {
            Request::Insert { key: k, value } => {
                assert_eq!(k, key(&[0.2, 0.3]));
                assert_eq!(value, b"hello world".to_vec(), "Value is everything after ')'");
            }
            other => panic!("Expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_append_with_empty_value() {
        let req = Request::parse("A (0.5,0.5)", None, 2).unwrap();
        assert!(matches!(req, Request::Append { ref value, .. } if value.is_empty()));
    }

    #[test]
    fn test_parse_lookup() {
        let req = Request::parse("L(0.8,0.9) 127.0.0.1 4000 0", None, 2).unwrap();
        match req {
            Request::Lookup { key: k, reply, hops } => {
                assert_eq!(k, key(&[0.8, 0.9]));
                assert_eq!(reply, Address::new("127.0.0.1", 4000));
                assert_eq!(hops, 0);
            }
            other => panic!("Expected lookup, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_range_and_format_back() {
        let line = "R((0.1,0.2),(0.3,0.4)) localhost 9000 3";
        let req = Request::parse(line, None, 2).unwrap();
        assert_eq!(req.to_string(), format!("{}\n", line));
    }

    #[test]
    fn test_parse_nearest_with_and_without_depth() {
        let req = Request::parse("N((0.5,0.5),3,-1) h 1 0", None, 2).unwrap();
        match req {
            Request::Nearest {
                k, radius, depth, ..
            } => {
                assert_eq!(k, 3);
                assert_eq!(radius, -1.0);
                assert_eq!(depth, 0, "Depth defaults to zero");
            }
            other => panic!("Expected nearest, got {:?}", other),
        }

        let req = Request::parse("N((0.5,0.5),3,inf) h 1 2 4", None, 2).unwrap();
        assert!(matches!(
            req,
            Request::Nearest { radius, depth: 4, hops: 2, .. } if radius.is_infinite()
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(Request::parse("X(1,2)", None, 2).is_err(), "Unknown tag");
        assert!(Request::parse("L(0.1,0.2 h 1 0", None, 2).is_err(), "Missing ')'");
        assert!(Request::parse("L(0.1,0.2) h", None, 2).is_err(), "Missing port");
        assert!(Request::parse("L(0.1,0.2,0.3) h 1 0", None, 2).is_err(), "Wrong arity");
        assert!(Request::parse("U(0.1,abc)x", None, 2).is_err(), "Bad coordinate");
        assert!(Request::parse("G 01", None, 2).is_err(), "Merge needs a description");
        let err = Request::parse("Z", None, 2).unwrap_err();
        assert!(err.is_fatal(), "Parse errors close the connection");
    }

    #[test]
    fn test_tag_replies() {
        assert_eq!(Tag::Lookup.ok(), "L OK\n");
        assert_eq!(Tag::Merge.bad(), "G BAD\n");
        assert!(Tag::Join.is_ok_reply("S OK"));
        assert!(!Tag::Join.is_ok_reply("S BAD"));
        assert!(Tag::Maintenance.carries_description());
        assert!(!Tag::Lookup.carries_description());
    }

    // ============================================================
    // DESCRIPTION TESTS
    // ============================================================

    #[test]
    fn test_root_description_text() {
        let desc = NodeDescription {
            lo: key(&[0.0, 0.0]),
            hi: key(&[1.0, 1.0]),
            address: Address::new("localhost", 7000),
            id: NodeId::default(),
            boundaries: vec![],
            siblings: vec![],
            entries: None,
        };
        let text = desc.to_string();
        assert_eq!(
            text,
            "#AREA\n0\n0\n1\n1\n#NODE\nlocalhost 7000\n\n\n#END\n",
            "Root descriptions carry blank id and boundary lines"
        );
        assert_eq!(NodeDescription::parse(&text, 2).unwrap(), desc);
    }

    #[test]
    fn test_split_description_with_tuples() {
        let text = "#AREA\n0.2\n0\n1\n1\n#NODE\nhostb 7001 \n1\n0.2\nhosta 7000\n\
                    #TUPLES 2\n0.8,0.9 y\n0.2,0.3 two words\n#END\n";
        let desc = NodeDescription::parse(text, 2).unwrap();
        assert_eq!(desc.lo, key(&[0.2, 0.0]));
        assert_eq!(desc.address, Address::new("hostb", 7001));
        assert_eq!(desc.id, NodeId("1".into()));
        assert_eq!(desc.boundaries, vec![0.2]);
        assert_eq!(desc.siblings, vec![Address::new("hosta", 7000)]);
        let entries = desc.entries.unwrap();
        assert_eq!(entries[1], Entry::new(key(&[0.2, 0.3]), b"two words".to_vec()));
    }

    #[test]
    fn test_description_rejects_truncation() {
        let text = "#AREA\n0\n0\n1\n1\n#NODE\nlocalhost 7000\n01\n0.5\n";
        assert!(NodeDescription::parse(text, 2).is_err());
        assert!(NodeDescription::parse("#NODE\n", 2).is_err());
    }

    #[test]
    fn test_description_rejects_inflated_tuple_count() {
        let text = "#AREA\n0\n0\n1\n1\n#NODE\nh 1\n\n\n#TUPLES 1000000000000\n#END\n";
        let err = NodeDescription::parse(text, 2).unwrap_err();
        assert!(err.is_fatal(), "A bad tuple count is a parse error");
        assert!(err.to_string().contains("promised"), "Got: {}", err);

        let short = "#AREA\n0\n0\n1\n1\n#NODE\nh 1\n\n\n#TUPLES 3\n0.1,0.1 a\n#END\n";
        assert!(NodeDescription::parse(short, 2).is_err());
    }

    #[test]
    fn test_merge_request_round_trips_description() {
        let text = "G 0\n#AREA\n0.5\n0\n1\n1\n#NODE\nh 2 \n1\n0.5\nh 1\n#TUPLES 0\n#END\n";
        let (head, body) = text.split_once('\n').unwrap();
        let req = Request::parse(head, Some(body), 2).unwrap();
        match &req {
            Request::Merge {
                target,
                description,
            } => {
                assert_eq!(target.0, "0");
                assert_eq!(description.entries.as_ref().map(Vec::len), Some(0));
            }
            other => panic!("Expected merge, got {:?}", other),
        }
        let again = req.to_string();
        assert!(again.starts_with("G 0\n#AREA\n"));
        assert!(again.ends_with("#TUPLES 0\n#END\n"));
    }

    // ============================================================
    // ANSWER TESTS
    // ============================================================

    #[test]
    fn test_answer_text_and_parse() {
        let answer = Answer::new(
            "L(0.8,0.9) h 1 0\n",
            2,
            &Address::new("hostb", 7001),
            NodeId("1".into()),
        )
        .with_items([AnswerItem::from_entry(&Entry::new(
            key(&[0.8, 0.9]),
            b"y".to_vec(),
        ))]);

        let text = answer.to_string();
        assert_eq!(
            text,
            "#ACK\n#QUERY: L(0.8,0.9) h 1 0\n#HOPS: 2\n#HOST: hostb:7001\n#ID: 1\n(key(0.8,0.9),[y])\n#END\n"
        );
        assert_eq!(Answer::parse(&text).unwrap(), answer);
    }

    #[test]
    fn test_lookup_miss_renders_empty_brackets() {
        let item = AnswerItem::miss(&key(&[0.1, 0.1]));
        assert_eq!(item.to_string(), "(key(0.1,0.1),[])\n");
    }

    #[test]
    fn test_merge_nearest_keeps_closest_unique() {
        let item = |d: f64, x: f64| AnswerItem {
            distance: Some(d),
            key: key(&[x, x]),
            value: String::new(),
        };
        let from = Address::new("h", 1);
        let a = Answer::new("N", 0, &from, NodeId::default()).with_items([item(0.3, 0.3), item(0.1, 0.1)]);
        let b = Answer::new("N", 1, &from, NodeId::default()).with_items([item(0.2, 0.2), item(0.1, 0.1)]);

        let merged = merge_nearest(&[a, b], 2);
        let distances: Vec<f64> = merged.iter().filter_map(|i| i.distance).collect();
        assert_eq!(distances, vec![0.1, 0.2]);
    }

    // ============================================================
    // CONNECTION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_connection_frames_lines_and_blocks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"W OK\r\n#AREA\n0\n#END\n")
                .await
                .unwrap();
        });

        let mut conn = Connection::open(&Address::new("127.0.0.1", port), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(conn.recv_reply().await.unwrap(), "W OK");
        assert_eq!(conn.recv_block().await.unwrap(), "#AREA\n0\n#END\n");
        server.await.unwrap();
        assert_eq!(conn.recv_line().await.unwrap(), None, "Peer closed");
    }

    #[tokio::test]
    async fn test_connection_reply_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::new(stream, Duration::from_millis(100));
        let err = conn.request("W\n").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
