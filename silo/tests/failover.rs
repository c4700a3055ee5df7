// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::*;

use silo::{InMemoryNetwork, PreferLocalPlacement, SiloStatus};

use std::{sync::Arc, time::Duration};

#[tokio::test]
async fn test_call_survives_owner_killed_mid_flight() {
    let network = InMemoryNetwork::new();
    let silos = start_cluster(&network, &[13001, 13002, 13003, 13004], |b| {
        b.with_placement(Arc::new(OwnerPlacement))
    })
    .await;
    let doomed = silos[1].address();
    let grain = grain_owned_by(&silos[0], "counter", &doomed);
    let response = silos[0].call(&grain, request(WHERE)).await.unwrap();
    assert_eq!(served_by(&response).0.silo, doomed);

    let (result, _) = tokio::join!(silos[0].call(&grain, slow_request(300)), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        network.kill(&doomed);
        silos[1].kill().await;
    });

    let (address, _) = served_by(&result.unwrap());
    assert_ne!(address.silo, doomed);
    assert!(silos[0].view().is_dead(&doomed));
    assert_eq!(silos[0].view().owner(&grain), Some(address.silo.clone()));
    assert_eq!(total_activations(&silos, &grain), 1);
}

#[tokio::test]
async fn test_activation_on_dead_silo_is_replaced() {
    let network = InMemoryNetwork::new();
    let silos = start_cluster(&network, &[13011, 13012, 13013, 13014], |b| {
        b.with_placement(Arc::new(PreferLocalPlacement))
    })
    .await;
    let host = silos[1].address();
    let owner = silos[2].address();
    let grain = grain_owned_by(&silos[0], "counter", &owner);

    // Hosted on one silo, registered on another, cached by a third.
    let response = silos[1].call(&grain, request(INCREMENT)).await.unwrap();
    assert_eq!(served_by(&response).0.silo, host);
    let response = silos[0].call(&grain, request(INCREMENT)).await.unwrap();
    assert_eq!(served_by(&response).1, 2);

    network.kill(&host);
    silos[1].kill().await;

    let response = silos[0].call(&grain, request(INCREMENT)).await.unwrap();
    let (address, value) = served_by(&response);
    assert_ne!(address.silo, host);
    assert_eq!(value, 1);
    assert_eq!(silos[2].directory_record(&grain).unwrap(), Some(address));
}

#[tokio::test]
async fn test_isolated_silo_rejoins_with_new_generation() {
    let network = InMemoryNetwork::new();
    let silos = start_cluster(&network, &[13021, 13022, 13023, 13024], |b| b).await;
    let isolated = silos[3].address();

    network.isolate(&isolated);
    assert!(
        eventually(Duration::from_secs(5), || {
            silos[..3].iter().all(|silo| silo.view().is_dead(&isolated))
        })
        .await
    );
    // Cut off from everyone, the isolated silo suspects nobody.
    assert_eq!(silos[3].view().active_silos().len(), 4);

    network.heal(&isolated);
    assert!(
        eventually(Duration::from_secs(5), || {
            let current = silos[3].address();
            current.generation() > isolated.generation()
                && silos[3].status() == Some(SiloStatus::Active)
                && silos.iter().all(|silo| {
                    silo.view().is_active(&current) && silo.view().is_dead(&isolated)
                })
        })
        .await
    );

    let grain = silo::GrainId::new("counter", "after-rejoin");
    let response = silos[3].call(&grain, request(INCREMENT)).await.unwrap();
    assert_eq!(served_by(&response).1, 1);
}
