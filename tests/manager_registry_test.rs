//! Integration coverage for `ChannelManager`'s registry and dedup behavior,
//! using `LoopbackSignalling` so no real network I/O occurs.

use meshctl::channel::ChannelKey;
use meshctl::signalling::LoopbackSignalling;
use meshctl::{Address, ChannelManager};

fn addr(ch: char) -> Address {
    Address::parse(&ch.to_string().repeat(40)).unwrap()
}

#[tokio::test]
async fn create_node_channel_registers_under_remote_signer() {
    let manager = ChannelManager::new(addr('a'));
    let (signalling, _peer) = LoopbackSignalling::pair();

    let channel = manager.create_node_channel(addr('b'), signalling).await;

    assert_eq!(channel.key(), ChannelKey::Node(addr('b')));
    assert!(manager.is_known_node(&addr('b')));
    assert_eq!(manager.get_node_channels().len(), 1);

    manager.dispose().await;
}

#[tokio::test]
async fn create_node_channel_is_idempotent_per_signer() {
    let manager = ChannelManager::new(addr('a'));
    let (first, _first_peer) = LoopbackSignalling::pair();
    let (second, _second_peer) = LoopbackSignalling::pair();

    let channel_one = manager.create_node_channel(addr('b'), first).await;
    let channel_two = manager.create_node_channel(addr('b'), second).await;

    assert!(std::sync::Arc::ptr_eq(&channel_one, &channel_two));
    assert_eq!(manager.get_node_channels().len(), 1);

    manager.dispose().await;
}

#[tokio::test]
async fn create_account_channel_registers_under_account_and_signer() {
    let manager = ChannelManager::new(addr('a'));
    let (signalling, _peer) = LoopbackSignalling::pair();

    let channel = manager.create_account_channel(addr('c'), addr('d'), signalling).await;

    assert_eq!(channel.key(), ChannelKey::Account(addr('c'), addr('d')));
    assert!(manager.is_known_account(&addr('c')));
    assert!(manager.is_known_account_signer(&addr('c'), &addr('d')));
    assert!(manager.get_account_channel(&addr('c'), &addr('d')).is_some());

    manager.dispose().await;
}

#[tokio::test]
async fn distinct_signers_on_the_same_account_get_distinct_channels() {
    let manager = ChannelManager::new(addr('a'));
    let (first, _first_peer) = LoopbackSignalling::pair();
    let (second, _second_peer) = LoopbackSignalling::pair();

    manager.create_account_channel(addr('c'), addr('d'), first).await;
    manager.create_account_channel(addr('c'), addr('e'), second).await;

    assert_eq!(manager.get_account_channels().len(), 2);
    assert!(manager.is_known_account_signer(&addr('c'), &addr('d')));
    assert!(manager.is_known_account_signer(&addr('c'), &addr('e')));

    manager.dispose().await;
}
