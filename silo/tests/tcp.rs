// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::*;

use silo::{GrainId, GrainTypeOptions, Silo, SiloAddress, SiloBuilder, SiloConfig};

use std::time::Duration;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|address| address.port())
        .unwrap()
}

async fn tcp_silo(config: SiloConfig) -> Silo {
    SiloBuilder::new(config)
        .register_grain("counter", counter, GrainTypeOptions::default())
        .start()
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_silos_over_tcp() {
    let seed_port = free_port();
    let first = tcp_silo(config(seed_port)).await;
    let second = tcp_silo(
        config(free_port()).with_seed(SiloAddress::seed("127.0.0.1", seed_port)),
    )
    .await;
    let silos = vec![first, second];
    assert!(eventually(Duration::from_secs(5), || all_see_active(&silos, 2)).await);

    let grains: Vec<GrainId> = (0..10)
        .map(|i| GrainId::new("counter", &format!("tcp-{}", i)))
        .collect();
    for grain in &grains {
        silos[0].call(grain, request(INCREMENT)).await.unwrap();
        let response = silos[1].call(grain, request(INCREMENT)).await.unwrap();
        assert_eq!(served_by(&response).1, 2);
        assert_eq!(total_activations(&silos, grain), 1);
    }

    silos[1].shutdown().await;
    assert!(
        eventually(Duration::from_secs(3), || {
            silos[0].view().is_dead(&silos[1].address())
        })
        .await
    );
    let response = silos[0].call(&grains[0], request(WHERE)).await.unwrap();
    assert_eq!(served_by(&response).0.silo, silos[0].address());
}
