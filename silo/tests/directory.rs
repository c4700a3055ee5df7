// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::*;

use silo::{
    ActivationAddress, ActivationId, DirectoryEntry, Error, InMemoryNetwork,
    PreferLocalPlacement, RequestHandler, SiloAddress, SiloRequest, SiloResponse,
    Transport,
};

use async_trait::async_trait;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

#[tokio::test]
async fn test_concurrent_activation_keeps_one_activation() {
    let network = InMemoryNetwork::new();
    let silos = start_cluster(&network, &[12001, 12002, 12003], |b| {
        b.with_placement(Arc::new(PreferLocalPlacement))
    })
    .await;
    let owner = silos[1].address();
    let grain = grain_owned_by(&silos[0], "slow", &owner);

    let (first, second) = tokio::join!(
        silos[0].call(&grain, request(WHERE)),
        silos[2].call(&grain, request(WHERE)),
    );
    let (first, _) = served_by(&first.unwrap());
    let (second, _) = served_by(&second.unwrap());

    assert_eq!(first, second);
    assert_eq!(total_activations(&silos, &grain), 1);
    assert_eq!(silos[1].directory_record(&grain).unwrap(), Some(first));
}

#[tokio::test]
async fn test_repeated_calls_reach_the_same_activation() {
    let network = InMemoryNetwork::new();
    let silos = start_cluster(&network, &[12011, 12012, 12013], |b| b).await;
    let grain = silo::GrainId::new("counter", "visits");

    for (i, silo) in silos.iter().cycle().take(6).enumerate() {
        let response = silo.call(&grain, request(INCREMENT)).await.unwrap();
        assert_eq!(served_by(&response).1, i as u64 + 1);
    }
    assert_eq!(total_activations(&silos, &grain), 1);
}

/// Answers every delivery with a stale activation.
struct StaleDeliveries {
    inner: InMemoryNetwork,
}

#[async_trait]
impl Transport for StaleDeliveries {
    async fn bind(
        &self,
        address: SiloAddress,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), Error> {
        self.inner.bind(address, handler).await
    }

    async fn unbind(&self, address: &SiloAddress) {
        self.inner.unbind(address).await
    }

    async fn request(
        &self,
        from: &SiloAddress,
        target: &SiloAddress,
        request: SiloRequest,
        timeout: Duration,
    ) -> Result<SiloResponse, Error> {
        match request {
            SiloRequest::Deliver { target, .. } => {
                Ok(SiloResponse::Failed(Error::StaleActivation(target)))
            }
            request => self.inner.request(from, target, request, timeout).await,
        }
    }
}

#[tokio::test]
async fn test_stale_routes_stop_at_forward_limit() {
    let network = InMemoryNetwork::new();
    let mut silos = start_cluster(&network, &[12021, 12022], |b| b).await;

    let caller = counter_builder(
        config(12023).with_seed(SiloAddress::seed("127.0.0.1", 12021)),
        &network,
    )
    .with_placement(Arc::new(OwnerPlacement))
    .with_transport(Arc::new(StaleDeliveries {
        inner: network.clone(),
    }))
    .start()
    .await
    .unwrap();
    silos.push(caller);
    assert!(eventually(Duration::from_secs(5), || all_see_active(&silos, 3)).await);

    // Hosted away from the caller, so every delivery crosses the transport.
    let grain = grain_owned_by(&silos[2], "counter", &silos[1].address());
    let result = silos[2].call(&grain, request(WHERE)).await;
    assert!(matches!(
        result,
        Err(Error::ForwardingLimitExceeded { limit: 3, .. })
    ));
}

#[tokio::test]
async fn test_joining_silo_takes_over_directory_entries() {
    let network = InMemoryNetwork::new();
    let mut silos = start_cluster(&network, &[12031, 12032], |b| b).await;
    let grains: Vec<silo::GrainId> = (0..30)
        .map(|i| silo::GrainId::new("counter", &format!("g{}", i)))
        .collect();
    for grain in &grains {
        silos[0].call(grain, request(INCREMENT)).await.unwrap();
    }

    let third = counter_builder(
        config(12033).with_seed(SiloAddress::seed("127.0.0.1", 12031)),
        &network,
    )
    .start()
    .await
    .unwrap();
    silos.push(third);
    assert!(eventually(Duration::from_secs(5), || all_see_active(&silos, 3)).await);

    let moved_to_third = grains
        .iter()
        .filter(|grain| silos[2].view().owner(grain) == Some(silos[2].address()))
        .count();
    assert!(moved_to_third > 0);
    assert!(
        eventually(Duration::from_secs(5), || {
            grains.iter().all(|grain| {
                let owner = silos[0].view().owner(grain);
                silos
                    .iter()
                    .find(|silo| Some(silo.address()) == owner)
                    .is_some_and(|silo| {
                        matches!(silo.directory_record(grain), Ok(Some(_)))
                    })
            })
        })
        .await
    );

    // The existing activations keep serving.
    for grain in &grains {
        let response = silos[2].call(grain, request(INCREMENT)).await.unwrap();
        assert_eq!(served_by(&response).1, 2);
    }
}

#[tokio::test]
async fn test_lookup_at_non_owner_names_the_owner() {
    let network = InMemoryNetwork::new();
    let silos = start_cluster(&network, &[12041, 12042], |b| b).await;
    let owner = silos[1].address();
    let grain = grain_owned_by(&silos[0], "counter", &owner);

    let response = network
        .request(
            &owner,
            &silos[0].address(),
            SiloRequest::Lookup { grain: grain.clone() },
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    match response {
        SiloResponse::Failed(Error::NotOwner {
            grain: refused,
            silo,
            owner_hint,
        }) => {
            assert_eq!(refused, grain);
            assert_eq!(silo, silos[0].address());
            assert_eq!(owner_hint, Some(owner));
        }
        other => panic!("expected NotOwner, got {:?}", other),
    }
}

/// Keeps the handlers bound through it.
struct KeepHandlers {
    inner: InMemoryNetwork,
    handlers: Mutex<Vec<Arc<dyn RequestHandler>>>,
}

#[async_trait]
impl Transport for KeepHandlers {
    async fn bind(
        &self,
        address: SiloAddress,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), Error> {
        self.handlers.lock().unwrap().push(handler.clone());
        self.inner.bind(address, handler).await
    }

    async fn unbind(&self, address: &SiloAddress) {
        self.inner.unbind(address).await
    }

    async fn request(
        &self,
        from: &SiloAddress,
        target: &SiloAddress,
        request: SiloRequest,
        timeout: Duration,
    ) -> Result<SiloResponse, Error> {
        self.inner.request(from, target, request, timeout).await
    }
}

#[tokio::test]
async fn test_dead_silo_refuses_lookup() {
    let network = InMemoryNetwork::new();
    let transport = Arc::new(KeepHandlers {
        inner: network.clone(),
        handlers: Mutex::new(Vec::new()),
    });
    let silo = counter_builder(config(12051), &network)
        .with_transport(transport.clone())
        .start()
        .await
        .unwrap();
    let myself = silo.address();
    let grain = grain_owned_by(&silo, "counter", &myself);
    silo.call(&grain, request(INCREMENT)).await.unwrap();

    silo.shutdown().await;
    let handler = transport.handlers.lock().unwrap()[0].clone();
    let response = tokio::time::timeout(
        Duration::from_secs(1),
        handler.handle(
            SiloAddress::seed("127.0.0.1", 12052),
            SiloRequest::Lookup { grain: grain.clone() },
        ),
    )
    .await
    .expect("dead silo did not answer");
    assert!(matches!(
        response,
        SiloResponse::Failed(Error::NotOwner { silo, owner_hint: None, .. })
            if silo == myself
    ));
}

#[tokio::test]
async fn test_handoff_loser_is_deactivated() {
    let network = InMemoryNetwork::new();
    let silos = start_cluster(&network, &[12061, 12062], |b| {
        b.with_placement(Arc::new(OwnerPlacement))
    })
    .await;
    let owner = silos[0].address();
    let grain = grain_owned_by(&silos[0], "counter", &owner);
    let response = silos[0].call(&grain, request(WHERE)).await.unwrap();
    let (local, _) = served_by(&response);
    assert_eq!(local.silo, owner);
    assert_eq!(silos[0].activation_count(), 1);

    // Smaller id than any generated one, so the handed over record wins.
    let winner = ActivationAddress::new(
        silos[1].address(),
        grain.clone(),
        ActivationId::from("0000"),
    );
    let response = network
        .request(
            &silos[1].address(),
            &owner,
            SiloRequest::Handoff {
                entries: vec![DirectoryEntry::valid(winner.clone())],
                hops: 0,
            },
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert!(!matches!(response, SiloResponse::Failed(_)));

    assert!(eventually(Duration::from_secs(3), || silos[0].activation_count() == 0).await);
    assert_eq!(silos[0].directory_record(&grain).unwrap(), Some(winner));
}
