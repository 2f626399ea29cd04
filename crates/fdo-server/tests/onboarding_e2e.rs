//! End-to-end protocol runs: DI, TO0, TO1, and TO2 against a combined
//! in-process server, driven by a simulated device.

mod support;

use std::sync::Arc;

use parking_lot::RwLock;

use fdo_crypto::{KexSuite, SigningKey};
use fdo_protocol::rendezvous::{RvInfo, RvTo2Addr};
use fdo_protocol::serviceinfo::ServiceInfoKv;
use fdo_protocol::voucher::OwnershipVoucher;
use fdo_server::{
    DiResponder, Dispatcher, DownloadModule, LocalTransport, MessageTransport, OwnerTo0Client,
    ServerError, To0Responder, To1Responder, To2Responder,
};
use fdo_store::{
    MemoryRvBlobStore, MemorySessionStore, MemoryVoucherStore, RvBlobStore, VoucherStore,
};

use support::SimulatedDevice;

/// Everything one test needs: all three roles behind one dispatcher.
struct TestEnv {
    transport: LocalTransport,
    mfg_key: Arc<SigningKey>,
    owner_key: Arc<SigningKey>,
    owner2_key: Arc<SigningKey>,
    vouchers: Arc<MemoryVoucherStore>,
    rv_blobs: Arc<MemoryRvBlobStore>,
}

fn build_env(modules: Vec<Arc<dyn fdo_server::OwnerModule>>) -> TestEnv {
    let sessions = Arc::new(MemorySessionStore::new());
    let vouchers = Arc::new(MemoryVoucherStore::new());
    let rv_blobs = Arc::new(MemoryRvBlobStore::new());

    let mfg_key = Arc::new(SigningKey::generate_es256());
    let owner_key = Arc::new(SigningKey::generate_es256());
    let owner2_key = Arc::new(SigningKey::generate_es256());
    let device_ca = Arc::new(fdo_crypto::DeviceCertAuthority::generate("Test Mfg CA").unwrap());
    let rv_info = Arc::new(RwLock::new(RvInfo::http("rv.example.com", 8041).unwrap()));
    let redirects = Arc::new(RwLock::new(vec![RvTo2Addr::http_dns("owner", 8043)]));

    let di = Arc::new(DiResponder::new(
        mfg_key.clone(),
        device_ca,
        rv_info,
        sessions.clone(),
        vouchers.clone(),
        None,
    ));
    let to0 = Arc::new(To0Responder::new(sessions.clone(), rv_blobs.clone(), None));
    let to1 = Arc::new(To1Responder::new(sessions.clone(), rv_blobs.clone()));
    let to2 = Arc::new(To2Responder::new(
        sessions.clone(),
        vouchers.clone(),
        owner_key.clone(),
        owner2_key.clone(),
        redirects,
        modules,
    ));

    let dispatcher = Arc::new(
        Dispatcher::new(sessions)
            .with_di(di)
            .with_rendezvous(to0, to1)
            .with_to2(to2),
    );

    TestEnv {
        transport: LocalTransport::new(dispatcher),
        mfg_key,
        owner_key,
        owner2_key,
        vouchers,
        rv_blobs,
    }
}

/// Extend the DI voucher to the owner key, as a transfer would.
async fn hand_to_owner(env: &TestEnv, device: &SimulatedDevice) {
    let guid = device.guid.unwrap();
    let bytes = env.vouchers.get(&guid).await.unwrap();
    let voucher = OwnershipVoucher::from_bytes(&bytes).unwrap();
    let extended = voucher
        .extend(&env.mfg_key, &env.owner_key.public_key().unwrap())
        .unwrap();
    extended.validate_chain(None).unwrap();
    env.vouchers
        .insert(guid, extended.to_bytes().unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn di_round_trip_persists_voucher() {
    let env = build_env(Vec::new());
    let mut device = SimulatedDevice::new("SN-0001", "demo-device");

    device.run_di(&env.transport).await.unwrap();
    let guid = device.guid.unwrap();

    let bytes = env.vouchers.get(&guid).await.unwrap();
    let voucher = OwnershipVoucher::from_bytes(&bytes).unwrap();
    assert_eq!(voucher.guid(), guid);
    assert_eq!(voucher.num_entries(), 0);
    // The persisted headerHmac is the device's HMAC over the exact
    // header bytes it received.
    voucher.verify_header_hmac(&device.hmac_secret).unwrap();
    assert_eq!(
        voucher.raw_header().as_bytes(),
        device.voucher_header.as_deref().unwrap()
    );
    voucher.validate_chain(None).unwrap();
}

#[tokio::test]
async fn to0_publish_then_to1_resolve() {
    let env = build_env(Vec::new());
    let mut device = SimulatedDevice::new("SN-0002", "demo-device");
    device.run_di(&env.transport).await.unwrap();
    hand_to_owner(&env, &device).await;

    let guid = device.guid.unwrap();
    let voucher =
        OwnershipVoucher::from_bytes(&env.vouchers.get(&guid).await.unwrap()).unwrap();

    let client = OwnerTo0Client::new(
        env.owner_key.clone(),
        vec![RvTo2Addr::http_dns("owner", 8043)],
    );
    let granted = client.publish(&voucher, 3600, &env.transport).await.unwrap();
    assert_eq!(granted, 3600);

    // The device resolves the exact published to1d bytes.
    let to1d = device.run_to1(&env.transport).await.unwrap();
    let stored = env.rv_blobs.get_rv_blob(&guid).await.unwrap();
    assert_eq!(to1d, stored.to1d);

    // The redirect is signed by the owner and binds the to0d hash.
    let payload = fdo_crypto::cose::sign1_verify(
        &to1d,
        &env.owner_key.public_key().unwrap().verifier().unwrap(),
    )
    .unwrap();
    let to1d_payload: fdo_protocol::messages::To1dPayload =
        fdo_cbor::from_cbor(&payload).unwrap();
    assert_eq!(to1d_payload.addrs[0].dns.as_deref(), Some("owner"));
}

#[tokio::test]
async fn expired_blob_yields_resource_not_found() {
    let env = build_env(Vec::new());
    let mut device = SimulatedDevice::new("SN-0003", "demo-device");
    device.run_di(&env.transport).await.unwrap();
    hand_to_owner(&env, &device).await;

    let guid = device.guid.unwrap();
    let voucher =
        OwnershipVoucher::from_bytes(&env.vouchers.get(&guid).await.unwrap()).unwrap();
    let client = OwnerTo0Client::new(
        env.owner_key.clone(),
        vec![RvTo2Addr::http_dns("owner", 8043)],
    );
    // A zero lifetime expires immediately, standing in for waiting out
    // waitSeconds + 1.
    client.publish(&voucher, 0, &env.transport).await.unwrap();

    let err = device.run_to1(&env.transport).await.unwrap_err();
    assert!(matches!(err, ServerError::Peer { code: 2, .. }), "{err}");
}

#[tokio::test]
async fn to2_happy_path_with_download_module() {
    let payload = vec![0xA7u8; 1500];
    let env = build_env(vec![Arc::new(
        DownloadModule::new("payload.bin", payload.clone()).with_chunk_size(1014),
    )]);
    let mut device = SimulatedDevice::new("SN-0004", "demo-device");
    device.run_di(&env.transport).await.unwrap();
    hand_to_owner(&env, &device).await;
    let original_guid = device.guid.unwrap();

    let devmod_active = ServiceInfoKv {
        key: "devmod:active".to_string(),
        value: fdo_cbor::to_canonical_cbor(&true).unwrap(),
    };
    let outcome = device
        .run_to2(
            &env.transport,
            KexSuite::Ecdh256,
            fdo_crypto::CipherSuite::A128Gcm.id(),
            1300,
            vec![devmod_active],
        )
        .await
        .unwrap();

    // The payload crossed in at least two encrypted messages.
    assert!(outcome.owner_messages >= 2, "{}", outcome.owner_messages);

    // Reassemble the fdo.download data values.
    let mut data = Vec::new();
    for (key, value) in &outcome.received {
        if key == "fdo.download:data" {
            let mut rest = value.as_slice();
            while !rest.is_empty() {
                let item = fdo_cbor::take_item(&mut rest).unwrap();
                let chunk: serde_bytes::ByteBuf = fdo_cbor::from_cbor(item).unwrap();
                data.extend_from_slice(&chunk);
            }
        }
    }
    assert_eq!(data, payload);
    let keys: Vec<&str> = outcome.received.iter().map(|(k, _)| k.as_str()).collect();
    assert!(keys.contains(&"fdo.download:active"));
    assert!(keys.contains(&"fdo.download:sha-384"));
    assert!(keys.contains(&"fdo.download:done"));

    // The voucher was replaced: new GUID, rooted at and extended to the
    // replacement owner key.
    assert_ne!(outcome.replacement_guid, original_guid);
    assert!(env.vouchers.get(&original_guid).await.is_err());
    let replacement = OwnershipVoucher::from_bytes(
        &env.vouchers.get(&outcome.replacement_guid).await.unwrap(),
    )
    .unwrap();
    let current = replacement.validate_chain(None).unwrap();
    assert_eq!(current, env.owner2_key.public_key().unwrap());
    assert!(replacement.num_entries() >= 1);
    replacement.verify_header_hmac(&device.hmac_secret).unwrap();
}

#[tokio::test]
async fn unimplemented_cipher_suite_is_refused() {
    let env = build_env(Vec::new());
    let mut device = SimulatedDevice::new("SN-0005", "demo-device");
    device.run_di(&env.transport).await.unwrap();
    hand_to_owner(&env, &device).await;

    // AES-CCM-16-128-128 (id 30) is deprecated and unimplemented.
    let err = device
        .run_to2(&env.transport, KexSuite::Ecdh256, 30, 1300, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Peer { code: 4, .. }), "{err}");
}

#[tokio::test]
async fn to2_refuses_unextended_voucher() {
    let env = build_env(Vec::new());
    let mut device = SimulatedDevice::new("SN-0006", "demo-device");
    device.run_di(&env.transport).await.unwrap();
    // No hand_to_owner: the voucher tail is still the manufacturer.

    let err = device
        .run_to2(
            &env.transport,
            KexSuite::Ecdh256,
            fdo_crypto::CipherSuite::A128Gcm.id(),
            1300,
            Vec::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Peer { code: 1, .. }), "{err}");
}

#[tokio::test]
async fn unknown_or_expired_token_is_unauthorized() {
    let env = build_env(Vec::new());

    // A mid-protocol message under a token the store has never seen (or
    // has expired) gets a bare 401, not a protocol error.
    let body = fdo_cbor::to_canonical_cbor(&fdo_protocol::messages::GetOvNextEntry {
        entry_num: 0,
    })
    .unwrap();
    let err = env
        .transport
        .call(62, Some("deadbeefdeadbeefdeadbeefdeadbeef".into()), body)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::InvalidToken), "{err}");
}

#[tokio::test]
async fn concurrent_sessions_stay_independent() {
    let env = build_env(Vec::new());
    let mut alpha = SimulatedDevice::new("SN-0007", "demo-device");
    let mut beta = SimulatedDevice::new("SN-0008", "demo-device");
    alpha.run_di(&env.transport).await.unwrap();
    beta.run_di(&env.transport).await.unwrap();

    assert_ne!(alpha.guid, beta.guid);
    let alpha_voucher =
        OwnershipVoucher::from_bytes(&env.vouchers.get(&alpha.guid.unwrap()).await.unwrap())
            .unwrap();
    let beta_voucher =
        OwnershipVoucher::from_bytes(&env.vouchers.get(&beta.guid.unwrap()).await.unwrap())
            .unwrap();
    assert_ne!(
        alpha_voucher.raw_header().as_bytes(),
        beta_voucher.raw_header().as_bytes()
    );
    // Each device's HMAC only verifies its own header.
    assert!(alpha_voucher.verify_header_hmac(&beta.hmac_secret).is_err());
}
