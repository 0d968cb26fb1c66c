use rb_backfiller::{
	AckAtomsRequest, BackfilleeMessage, BackfillerConfig, FifoError, GoRequest, PreAtomsRequest,
	ProtocolError, VersionStamp, WriteToken,
};

use tracing_test::traced_test;

mod common;

use common::{
	k, keys, new_backfiller, new_backfiller_sharing, pre_atom, r, session, total_size, Backfillee,
	MemoryStore, ATOM_SIZE,
};

#[tokio::test]
#[traced_test]
async fn streams_only_the_session_range() {
	let (backfiller, _store) =
		new_backfiller(MemoryStore::with_keys(r(0, 100), [5, 20, 40]), BackfillerConfig::default());
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	let ours = backfillee.request_pre_atoms(r(0, 50), vec![]).await;
	assert_eq!(
		ours.iter().map(|pre_atom| pre_atom.key.clone()).collect::<Vec<_>>(),
		vec![k(5), k(20), k(40)]
	);

	let s1 = session();
	backfillee.address.go(s1, r(10, 30)).await.unwrap();
	let atoms = backfillee.recv_session(s1, &r(10, 30)).await;
	assert_eq!(keys(&atoms), vec![k(20)]);
	assert_eq!(total_size(&atoms), ATOM_SIZE);

	backfillee
		.address
		.ack_atoms(s1, r(10, 30), ATOM_SIZE)
		.await
		.unwrap();
	let stop_token = backfillee.address.stop(s1).await.unwrap();

	// Coverage outlives the first session, the same range can be streamed again
	let s2 = session();
	backfillee.address.go(s2, r(10, 30)).await.unwrap();

	loop {
		match backfillee.recv().await {
			// Session 1 may have completed before the stop got applied
			BackfilleeMessage::Rejected { token, error } => {
				assert_eq!(token, stop_token);
				assert_eq!(error, ProtocolError::UnknownSession(s1));
			}
			BackfilleeMessage::Atoms {
				session_id, atoms, ..
			} => {
				assert_eq!(session_id, s2);
				assert_eq!(keys(&atoms), vec![k(20)]);
				break;
			}
			other => panic!("unexpected message {other:?}"),
		}
	}

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn go_requires_queued_pre_atoms() {
	let (backfiller, _store) =
		new_backfiller(MemoryStore::with_keys(r(0, 100), [5, 20, 40]), BackfillerConfig::default());
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	let token = backfillee.address.go(session(), r(60, 70)).await.unwrap();

	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::RangeNotQueued { range: r(60, 70) },
		}
	);

	backfillee.request_pre_atoms(r(0, 50), vec![]).await;

	// Partially covered is not covered
	let token = backfillee.address.go(session(), r(40, 70)).await.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::RangeNotQueued { range: r(40, 70) },
		}
	);

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn adjacent_requests_chain_into_one_session() {
	let (backfiller, _store) =
		new_backfiller(MemoryStore::with_keys(r(0, 100), [5, 20, 60]), BackfillerConfig::default());
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	backfillee.request_pre_atoms(r(0, 50), vec![]).await;
	backfillee.request_pre_atoms(r(50, 100), vec![]).await;

	let s1 = session();
	backfillee.address.go(s1, r(0, 100)).await.unwrap();
	let atoms = backfillee.recv_session(s1, &r(0, 100)).await;

	assert_eq!(keys(&atoms), vec![k(5), k(20), k(60)]);

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn only_one_session_at_a_time() {
	let (backfiller, _store) =
		new_backfiller(MemoryStore::with_keys(r(0, 100), [5, 20, 70]), BackfillerConfig::default());
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	backfillee.request_pre_atoms(r(0, 100), vec![]).await;

	let s1 = session();
	backfillee.address.go(s1, r(0, 50)).await.unwrap();
	backfillee.recv_session(s1, &r(0, 50)).await;

	// Nothing acknowledged, so session 1 is still waiting on its reservation
	let token = backfillee.address.go(session(), r(50, 100)).await.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::SessionAlreadyActive { active: s1 },
		}
	);

	backfillee.address.stop(s1).await.unwrap();

	let s2 = session();
	backfillee.address.go(s2, r(50, 100)).await.unwrap();
	let atoms = backfillee.recv_session(s2, &r(50, 100)).await;
	assert_eq!(keys(&atoms), vec![k(70)]);

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn ranges_outside_the_region_are_rejected() {
	let (backfiller, _store) =
		new_backfiller(MemoryStore::with_keys(r(0, 100), [5]), BackfillerConfig::default());
	let backfillee = Backfillee::register(&backfiller, r(0, 50)).await;

	let token = backfillee.address.pre_atoms(r(40, 60), vec![]).await.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::RangeOutsideRegion {
				range: r(40, 60),
				region: r(0, 50).into(),
			},
		}
	);

	let token = backfillee
		.address
		.pre_atoms(r(0, 10), vec![pre_atom(30, 1)])
		.await
		.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::PreAtomOutsideRange { range: r(0, 10) },
		}
	);

	let token = backfillee.address.pre_atoms(r(10, 10), vec![]).await.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::EmptyRange,
		}
	);

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn overlapping_pre_atoms_are_reported_and_later_wins() {
	let (backfiller, _store) =
		new_backfiller(MemoryStore::with_keys(r(0, 100), [5, 40, 60]), BackfillerConfig::default());
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	backfillee.request_pre_atoms(r(0, 50), vec![]).await;

	let token = backfillee
		.address
		.pre_atoms(r(30, 100), vec![])
		.await
		.unwrap();

	assert!(matches!(
		backfillee.recv().await,
		BackfilleeMessage::PreAtoms { range, .. } if range == r(30, 100)
	));
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::OverlappingPreAtoms {
				pending: r(0, 50),
				requested: r(30, 100),
			},
		}
	);

	let s1 = session();
	backfillee.address.go(s1, r(0, 100)).await.unwrap();
	let atoms = backfillee.recv_session(s1, &r(0, 100)).await;
	assert_eq!(keys(&atoms), vec![k(5), k(40), k(60)]);

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn hints_for_missing_keys_stream_as_deletions() {
	let store = MemoryStore::with_keys(r(0, 100), [5]);
	let (backfiller, _store) = new_backfiller(store, BackfillerConfig::default());
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	backfillee
		.request_pre_atoms(r(0, 100), vec![pre_atom(60, 3)])
		.await;

	let s1 = session();
	backfillee.address.go(s1, r(50, 100)).await.unwrap();
	let atoms = backfillee.recv_session(s1, &r(50, 100)).await;

	assert_eq!(keys(&atoms), vec![k(60)]);
	assert_eq!(atoms[0].value, None);

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn stop_returns_unacknowledged_pre_atoms_to_the_queue() {
	// The store changed nothing since the common version, only hinted keys get streamed
	let (backfiller, _store) = new_backfiller_sharing(
		MemoryStore::with_keys(r(0, 100), [20, 30]),
		VersionStamp::new(1),
		BackfillerConfig::default(),
	);
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	let ours = backfillee
		.request_pre_atoms(r(0, 100), vec![pre_atom(20, 2), pre_atom(30, 2)])
		.await;
	assert!(ours.is_empty());

	let s1 = session();
	backfillee.address.go(s1, r(0, 100)).await.unwrap();
	let atoms = backfillee.recv_session(s1, &r(0, 100)).await;
	assert_eq!(keys(&atoms), vec![k(20), k(30)]);

	// Only key 20 gets acknowledged before stopping
	backfillee
		.address
		.ack_atoms(s1, r(0, 25), ATOM_SIZE)
		.await
		.unwrap();
	backfillee.address.stop(s1).await.unwrap();

	let s2 = session();
	backfillee.address.go(s2, r(0, 100)).await.unwrap();
	let atoms = backfillee.recv_session(s2, &r(0, 100)).await;
	assert_eq!(keys(&atoms), vec![k(30)]);

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn acknowledgments_are_checked() {
	let (backfiller, _store) =
		new_backfiller(MemoryStore::with_keys(r(0, 100), [5, 20, 40]), BackfillerConfig::default());
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	backfillee.request_pre_atoms(r(0, 100), vec![]).await;

	let s1 = session();
	backfillee.address.go(s1, r(0, 50)).await.unwrap();
	let atoms = backfillee.recv_session(s1, &r(0, 50)).await;
	let held = total_size(&atoms);
	assert_eq!(held, 3 * ATOM_SIZE);

	let token = backfillee
		.address
		.ack_atoms(s1, r(0, 50), held + 1)
		.await
		.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::AckExceedsReservation {
				requested: held + 1,
				held,
			},
		}
	);

	let token = backfillee
		.address
		.ack_atoms(s1, r(40, 60), ATOM_SIZE)
		.await
		.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::AckOutsideSession {
				range: r(40, 60),
				session_range: r(0, 50),
			},
		}
	);

	let other = session();
	let token = backfillee
		.address
		.ack_atoms(other, r(0, 50), ATOM_SIZE)
		.await
		.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::UnknownSession(other),
		}
	);

	// The rejected acknowledgments released nothing
	assert_eq!(backfiller.reserved_bytes(), held);

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn acknowledging_past_the_streamed_span_is_refused() {
	let (backfiller, _store) = new_backfiller_sharing(
		MemoryStore::with_keys(r(0, 100), [20, 30]),
		VersionStamp::new(1),
		BackfillerConfig {
			atom_throttle_bytes: ATOM_SIZE,
			max_batch_bytes: ATOM_SIZE,
			..Default::default()
		},
	);
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	backfillee
		.request_pre_atoms(r(0, 100), vec![pre_atom(20, 2), pre_atom(30, 2)])
		.await;

	// Key 30 waits on the throttle, only the first batch went out
	let s1 = session();
	backfillee.address.go(s1, r(0, 100)).await.unwrap();
	let (range, atoms) = backfillee.recv_atoms(s1).await;
	assert_eq!(range, r(0, 30));
	assert_eq!(keys(&atoms), vec![k(20)]);

	let token = backfillee
		.address
		.ack_atoms(s1, r(0, 100), ATOM_SIZE)
		.await
		.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::AckBeyondStreamed {
				range: r(0, 100),
				streamed: r(0, 30),
			},
		}
	);
	assert_eq!(backfiller.reserved_bytes(), ATOM_SIZE);

	backfillee.address.stop(s1).await.unwrap();

	// Nothing was acknowledged, so both keys come again
	let s2 = session();
	backfillee.address.go(s2, r(0, 100)).await.unwrap();

	let (range, atoms) = backfillee.recv_atoms(s2).await;
	assert_eq!(range, r(0, 30));
	assert_eq!(keys(&atoms), vec![k(20)]);

	backfillee
		.address
		.ack_atoms(s2, range, ATOM_SIZE)
		.await
		.unwrap();

	let (range, atoms) = backfillee.recv_atoms(s2).await;
	assert_eq!(range, r(30, 100));
	assert_eq!(keys(&atoms), vec![k(30)]);

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn acknowledged_size_must_match_the_batches_sent() {
	let (backfiller, _store) = new_backfiller(
		MemoryStore::with_keys(r(0, 100), [5, 20, 40]),
		BackfillerConfig {
			atom_throttle_bytes: 3 * ATOM_SIZE,
			max_batch_bytes: ATOM_SIZE,
			..Default::default()
		},
	);
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	backfillee.request_pre_atoms(r(0, 100), vec![]).await;

	let s1 = session();
	backfillee.address.go(s1, r(0, 50)).await.unwrap();
	let atoms = backfillee.recv_session(s1, &r(0, 50)).await;
	assert_eq!(keys(&atoms), vec![k(5), k(20), k(40)]);
	assert_eq!(backfiller.reserved_bytes(), 3 * ATOM_SIZE);

	// Only key 5 went out in [0, 20)
	let token = backfillee
		.address
		.ack_atoms(s1, r(0, 20), 2 * ATOM_SIZE)
		.await
		.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::AckExceedsSent {
				range: r(0, 20),
				requested: 2 * ATOM_SIZE,
				sent: ATOM_SIZE,
			},
		}
	);
	assert_eq!(backfiller.reserved_bytes(), 3 * ATOM_SIZE);

	backfillee
		.address
		.ack_atoms(s1, r(0, 40), 2 * ATOM_SIZE)
		.await
		.unwrap();

	// The same batches can't be acknowledged twice
	let token = backfillee
		.address
		.ack_atoms(s1, r(0, 40), ATOM_SIZE)
		.await
		.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::AckExceedsSent {
				range: r(0, 40),
				requested: ATOM_SIZE,
				sent: 0,
			},
		}
	);
	assert_eq!(backfiller.reserved_bytes(), ATOM_SIZE);

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn reordered_deliveries_apply_in_token_order() {
	let (backfiller, _store) =
		new_backfiller(MemoryStore::with_keys(r(0, 100), [5, 20]), BackfillerConfig::default());
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	let pre_atoms_token = backfillee.address.stamp();
	let go_token = backfillee.address.stamp();
	let s1 = session();

	// The go overtakes the pre-atoms request it depends on
	backfillee
		.address
		.send_go(
			go_token,
			GoRequest {
				session_id: s1,
				range: r(0, 100),
			},
		)
		.await
		.unwrap();
	backfillee
		.address
		.send_pre_atoms(
			pre_atoms_token,
			PreAtomsRequest {
				range: r(0, 100),
				pre_atoms: vec![],
			},
		)
		.await
		.unwrap();

	assert!(matches!(
		backfillee.recv().await,
		BackfilleeMessage::PreAtoms { .. }
	));
	let atoms = backfillee.recv_session(s1, &r(0, 100)).await;
	assert_eq!(keys(&atoms), vec![k(5), k(20)]);

	// Replaying an applied token is refused
	backfillee
		.address
		.send_ack_atoms(
			go_token,
			AckAtomsRequest {
				session_id: s1,
				range: r(0, 100),
				size: total_size(&atoms),
			},
		)
		.await
		.unwrap();
	assert!(matches!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::WriteToken(FifoError::Stale { .. }),
		} if token == go_token
	));
	assert_eq!(backfiller.reserved_bytes(), total_size(&atoms));

	backfiller.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn deliveries_far_past_a_gap_are_refused() {
	let (backfiller, _store) = new_backfiller(
		MemoryStore::with_keys(r(0, 100), [5]),
		BackfillerConfig {
			reorder_window: 4,
			..Default::default()
		},
	);
	let backfillee = Backfillee::register(&backfiller, r(0, 100)).await;

	// Tokens 0 to 3 are never delivered
	for _ in 0..4 {
		backfillee.address.stamp();
	}

	let s1 = session();
	let token = backfillee.address.go(s1, r(0, 100)).await.unwrap();
	assert_eq!(
		backfillee.recv().await,
		BackfilleeMessage::Rejected {
			token,
			error: ProtocolError::WriteToken(FifoError::TooFarAhead {
				token,
				next_expected: WriteToken::new(0),
				window: 4,
			}),
		}
	);

	backfiller.shutdown().await;
}
