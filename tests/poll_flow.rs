use alloy::primitives::{keccak256, Address, LogData, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use datacoin_listener::events::abi::{Redeemed, Transfer};
use datacoin_listener::events::lower_hex;
use datacoin_listener::prelude::*;
use datacoin_listener::signer::token_from_url;
use datacoin_listener::{AccessGrant, CheckpointPolicy, ChainEvent, DatasetRecord, Registry};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// ------- In-memory checkpoint -------
struct MemCheckpoint {
    block: Mutex<Option<u64>>,
}
impl MemCheckpoint {
    fn at(block: u64) -> Self {
        Self {
            block: Mutex::new(Some(block)),
        }
    }
    fn empty() -> Self {
        Self {
            block: Mutex::new(None),
        }
    }
    fn get(&self) -> Option<u64> {
        *self.block.lock().unwrap()
    }
}
#[async_trait]
impl CheckpointStore for MemCheckpoint {
    async fn load_checkpoint(&self) -> anyhow::Result<Option<u64>> {
        Ok(*self.block.lock().unwrap())
    }
    async fn save_checkpoint(&self, block: u64) -> anyhow::Result<()> {
        *self.block.lock().unwrap() = Some(block);
        Ok(())
    }
}

/// ------- In-memory registry, mutable between cycles -------
#[derive(Default)]
struct MemRegistry {
    records: Mutex<Vec<(String, DatasetRecord)>>,
}
impl MemRegistry {
    fn with(token: &str, symbol: &str, cid: &str) -> Self {
        let reg = Self::default();
        reg.add(token, symbol, cid);
        reg
    }
    fn add(&self, token: &str, symbol: &str, cid: &str) {
        self.records
            .lock()
            .unwrap()
            .push((token.to_string(), DatasetRecord::new(symbol, cid)));
    }
}
#[async_trait]
impl RegistryStore for MemRegistry {
    async fn load_registry(&self) -> anyhow::Result<Registry> {
        Ok(Registry::from_records(self.records.lock().unwrap().clone()))
    }
}

/// ------- In-memory grant log -------
#[derive(Default)]
struct MemGrants {
    rows: Mutex<Vec<AccessGrant>>,
}
impl MemGrants {
    fn rows(&self) -> Vec<AccessGrant> {
        self.rows.lock().unwrap().clone()
    }
}
#[async_trait]
impl GrantStore for MemGrants {
    async fn append_grant(&self, grant: AccessGrant) -> anyhow::Result<()> {
        self.rows.lock().unwrap().push(grant);
        Ok(())
    }
    async fn latest_grant(&self, user: &str, symbol: &str) -> anyhow::Result<Option<AccessGrant>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|g| g.user.eq_ignore_ascii_case(user) && g.symbol == symbol)
            .cloned())
    }
}

/// ------- Scripted chain: fixed head, canned logs, some blocks that always fail -------
#[derive(Default)]
struct ScriptedChain {
    head: Mutex<u64>,
    head_fails: bool,
    logs: Vec<Log>,
    broken: HashSet<u64>,
    queries: Mutex<Vec<(Address, u64, u64)>>,
}
impl ScriptedChain {
    fn new(head: u64, logs: Vec<Log>) -> Self {
        Self {
            head: Mutex::new(head),
            logs,
            ..Default::default()
        }
    }
    fn queries(&self) -> Vec<(Address, u64, u64)> {
        self.queries.lock().unwrap().clone()
    }
}
#[async_trait]
impl LogSource for ScriptedChain {
    async fn head(&self) -> anyhow::Result<u64> {
        if self.head_fails {
            anyhow::bail!("all endpoints down");
        }
        Ok(*self.head.lock().unwrap())
    }
    async fn logs(&self, address: Address, from: u64, to: u64) -> anyhow::Result<Vec<Log>> {
        self.queries.lock().unwrap().push((address, from, to));
        if (from..=to).any(|b| self.broken.contains(&b)) {
            anyhow::bail!("query returned more than 10000 results");
        }
        Ok(self
            .logs
            .iter()
            .filter(|l| l.address() == address)
            .filter(|l| (from..=to).contains(&l.block_number.unwrap_or_default()))
            .cloned()
            .collect())
    }
}

/// Hooks that just record what they were given.
struct Recorder {
    targets: Vec<Address>,
    seen: Mutex<Vec<ChainEvent>>,
}
#[async_trait]
impl ListenerHooks for Recorder {
    async fn targets(&self) -> anyhow::Result<Vec<Address>> {
        Ok(self.targets.clone())
    }
    async fn on_event(&self, event: ChainEvent) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event);
        Ok(())
    }
}

const SECRET: &str = "test-download-secret";

fn token() -> Address {
    Address::repeat_byte(0x7a)
}

fn holder() -> Address {
    "0xAbCdEf0123456789aBcDeF0123456789AbCdEf01".parse().unwrap()
}

fn rpc_log(address: Address, data: LogData, block: u64) -> Log {
    Log {
        inner: alloy::primitives::Log { address, data },
        block_number: Some(block),
        ..Default::default()
    }
}

fn transfer(token: Address, from: Address, to: Address, value: u64, block: u64) -> Log {
    let data = Transfer {
        from,
        to,
        value: U256::from(value),
    }
    .encode_log_data();
    rpc_log(token, data, block)
}

fn redeemed(token: Address, user: Address, amount: u64, ticker: &str, block: u64) -> Log {
    let data = Redeemed {
        user,
        amount: U256::from(amount),
        ticker: keccak256(ticker),
    }
    .encode_log_data();
    rpc_log(token, data, block)
}

fn issuer(registry: MemRegistry) -> GrantIssuer<MemRegistry, MemGrants> {
    GrantIssuer::new(registry, MemGrants::default(), GrantSigner::new(SECRET).unwrap())
}

#[tokio::test]
async fn burn_produces_one_grant_and_advances_checkpoint() -> anyhow::Result<()> {
    let hooks = issuer(MemRegistry::with(&lower_hex(&token()), "ABC", "bafy123"));
    let chain = ScriptedChain::new(105, vec![transfer(token(), holder(), Address::ZERO, 500, 103)]);
    let engine = PollEngine::new(MemCheckpoint::at(100), chain);

    let outcome = engine.poll_once(&hooks).await?;

    assert_eq!(outcome.checkpoint, 105);
    assert_eq!(outcome.scanned, Some((101, 105)));
    assert_eq!(outcome.events, 1);
    assert!(outcome.dropped_blocks.is_empty());

    let rows = hooks.grants().rows();
    assert_eq!(rows.len(), 1);
    let grant = &rows[0];
    assert_eq!(grant.user, "0xabcdef0123456789abcdef0123456789abcdef01");
    assert_eq!(grant.symbol, "ABC");
    assert_eq!(grant.token, lower_hex(&token()));
    assert_eq!(grant.amount, "500");
    assert!(grant.download_url.contains("bafy123"));
    assert!(grant.ts > 0);

    let claims = GrantSigner::new(SECRET)?.verify(token_from_url(&grant.download_url).unwrap())?;
    assert_eq!(claims.cid, "bafy123");
    assert_eq!(claims.user, grant.user);
    Ok(())
}

#[tokio::test]
async fn ordinary_transfer_is_ignored_but_checkpoint_moves() -> anyhow::Result<()> {
    let hooks = issuer(MemRegistry::with(&lower_hex(&token()), "ABC", "bafy123"));
    let other = Address::repeat_byte(0x01);
    let chain = ScriptedChain::new(105, vec![transfer(token(), holder(), other, 500, 103)]);
    let store = Arc::new(MemCheckpoint::at(100));
    let engine = PollEngine::new(store.clone(), chain);

    let outcome = engine.poll_once(&hooks).await?;

    assert_eq!(outcome.events, 1);
    assert!(hooks.grants().rows().is_empty());
    assert_eq!(store.get(), Some(105));
    Ok(())
}

#[tokio::test]
async fn redemption_grants_access() -> anyhow::Result<()> {
    let hooks = issuer(MemRegistry::with(&lower_hex(&token()), "ABC", "bafy123"));
    let chain = ScriptedChain::new(105, vec![redeemed(token(), holder(), 42, "ABC", 102)]);
    let engine = PollEngine::new(MemCheckpoint::at(100), chain);

    engine.poll_once(&hooks).await?;

    let rows = hooks.grants().rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, "42");
    assert_eq!(rows[0].user, lower_hex(&holder()));
    Ok(())
}

#[tokio::test]
async fn failed_block_is_dropped_and_best_effort_still_advances() -> anyhow::Result<()> {
    let hooks = issuer(MemRegistry::with(&lower_hex(&token()), "ABC", "bafy123"));
    let mut chain = ScriptedChain::new(
        105,
        vec![
            transfer(token(), holder(), Address::ZERO, 1, 103),
            transfer(token(), holder(), Address::ZERO, 2, 104),
        ],
    );
    chain.broken.insert(104);
    let chain = Arc::new(chain);
    let store = Arc::new(MemCheckpoint::at(100));
    let engine = PollEngine::new(store.clone(), chain.clone());

    let outcome = engine.poll_once(&hooks).await?;

    assert_eq!(outcome.dropped_blocks, vec![(token(), 104)]);
    assert_eq!(store.get(), Some(105));

    // range query first, then one query per block
    let queries = chain.queries();
    assert_eq!(queries[0], (token(), 101, 105));
    let singles: Vec<u64> = queries[1..].iter().map(|(_, f, _)| *f).collect();
    assert_eq!(singles, vec![101, 102, 103, 104, 105]);
    assert!(queries[1..].iter().all(|(_, f, t)| f == t));

    // block 103 still produced its grant
    let rows = hooks.grants().rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, "1");
    Ok(())
}

#[tokio::test]
async fn strict_policy_holds_checkpoint_when_blocks_are_dropped() -> anyhow::Result<()> {
    let hooks = issuer(MemRegistry::with(&lower_hex(&token()), "ABC", "bafy123"));
    let mut chain = ScriptedChain::new(105, vec![]);
    chain.broken.insert(104);
    let store = Arc::new(MemCheckpoint::at(100));
    let engine = PollEngine::new(store.clone(), chain).with_policy(CheckpointPolicy::Strict);

    let outcome = engine.poll_once(&hooks).await?;

    assert_eq!(outcome.dropped_blocks.len(), 1);
    assert_eq!(outcome.checkpoint, 100);
    assert!(!outcome.advanced(100));
    assert_eq!(store.get(), Some(100));
    Ok(())
}

#[tokio::test]
async fn head_failure_aborts_without_advancing() {
    let hooks = issuer(MemRegistry::with(&lower_hex(&token()), "ABC", "bafy123"));
    let chain = ScriptedChain {
        head_fails: true,
        ..Default::default()
    };
    let store = Arc::new(MemCheckpoint::at(100));
    let engine = PollEngine::new(store.clone(), chain);

    assert!(engine.poll_once(&hooks).await.is_err());
    assert_eq!(store.get(), Some(100));
}

#[tokio::test]
async fn unknown_token_is_dropped() -> anyhow::Result<()> {
    let stranger = Address::repeat_byte(0x99);
    let registry = MemRegistry::with(&lower_hex(&token()), "ABC", "bafy123");
    let hooks = issuer(registry);
    let event = datacoin_listener::events::decode_log(&transfer(
        stranger,
        holder(),
        Address::ZERO,
        5,
        103,
    ))
    .unwrap();

    assert!(hooks.issue(&event).await?.is_none());
    assert!(hooks.grants().rows().is_empty());
    Ok(())
}

#[tokio::test]
async fn nothing_new_means_no_queries_and_no_writes() -> anyhow::Result<()> {
    let hooks = issuer(MemRegistry::with(&lower_hex(&token()), "ABC", "bafy123"));
    let chain = Arc::new(ScriptedChain::new(100, vec![]));
    let engine = PollEngine::new(MemCheckpoint::at(100), chain.clone());

    let outcome = engine.poll_once(&hooks).await?;

    assert_eq!(outcome.scanned, None);
    assert_eq!(outcome.checkpoint, 100);
    assert!(chain.queries().is_empty());
    Ok(())
}

#[tokio::test]
async fn empty_registry_still_advances() -> anyhow::Result<()> {
    let hooks = issuer(MemRegistry::default());
    let chain = Arc::new(ScriptedChain::new(120, vec![]));
    let store = Arc::new(MemCheckpoint::at(100));
    let engine = PollEngine::new(store.clone(), chain.clone());

    let outcome = engine.poll_once(&hooks).await?;

    assert_eq!(outcome.targets, 0);
    assert_eq!(store.get(), Some(120));
    assert!(chain.queries().is_empty());
    Ok(())
}

#[tokio::test]
async fn first_run_starts_six_blocks_behind_head() -> anyhow::Result<()> {
    let hooks = Recorder {
        targets: vec![token()],
        seen: Mutex::new(Vec::new()),
    };
    // burn at 93 lies before the start window; burn at 95 is inside it
    let chain = Arc::new(ScriptedChain::new(
        100,
        vec![
            transfer(token(), holder(), Address::ZERO, 1, 93),
            transfer(token(), holder(), Address::ZERO, 2, 95),
        ],
    ));
    let store = Arc::new(MemCheckpoint::empty());
    let engine = PollEngine::new(store.clone(), chain.clone());

    let outcome = engine.poll_once(&hooks).await?;

    assert_eq!(outcome.scanned, Some((95, 100)));
    assert_eq!(store.get(), Some(100));
    let seen = hooks.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].block_number, 95);
    Ok(())
}

#[tokio::test]
async fn replayed_range_appends_equivalent_grants() -> anyhow::Result<()> {
    let hooks = issuer(MemRegistry::with(&lower_hex(&token()), "ABC", "bafy123"));
    let chain = ScriptedChain::new(105, vec![transfer(token(), holder(), Address::ZERO, 500, 103)]);
    let store = Arc::new(MemCheckpoint::at(100));
    let engine = PollEngine::new(store.clone(), chain);

    engine.poll_once(&hooks).await?;
    // crash before the checkpoint write: the same range is scanned again
    store.save_checkpoint(100).await?;
    engine.poll_once(&hooks).await?;

    let rows = hooks.grants().rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        (&rows[0].user, &rows[0].symbol, &rows[0].token, &rows[0].amount),
        (&rows[1].user, &rows[1].symbol, &rows[1].token, &rows[1].amount)
    );

    let latest = hooks
        .grants()
        .latest_grant(&lower_hex(&holder()).to_uppercase().replace("0X", "0x"), "ABC")
        .await?;
    assert_eq!(latest.as_ref(), rows.last());
    Ok(())
}

#[tokio::test]
async fn mixed_case_registry_key_and_prefixed_cid() -> anyhow::Result<()> {
    let key = lower_hex(&token()).to_uppercase().replace("0X", "0x");
    let hooks = issuer(MemRegistry::with(&key, "XYZ", "ipfs://bafyPrefixed"));
    let chain = ScriptedChain::new(105, vec![transfer(token(), holder(), Address::ZERO, 9, 101)]);
    let engine = PollEngine::new(MemCheckpoint::at(100), chain);

    engine.poll_once(&hooks).await?;

    let rows = hooks.grants().rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].symbol, "XYZ");
    assert!(rows[0]
        .download_url
        .starts_with("https://gateway.lighthouse.storage/ipfs/bafyPrefixed?token="));
    Ok(())
}

#[tokio::test]
async fn token_registered_between_cycles_is_picked_up() -> anyhow::Result<()> {
    let late = Address::repeat_byte(0x5e);
    let registry = Arc::new(MemRegistry::with(&lower_hex(&token()), "ABC", "bafy123"));
    let hooks = GrantIssuer::new(
        registry.clone(),
        MemGrants::default(),
        GrantSigner::new(SECRET)?,
    );
    let chain = Arc::new(ScriptedChain::new(
        105,
        vec![transfer(late, holder(), Address::ZERO, 3, 107)],
    ));
    let engine = PollEngine::new(MemCheckpoint::at(100), chain.clone());

    engine.poll_once(&hooks).await?;
    assert!(hooks.grants().rows().is_empty());

    registry.add(&lower_hex(&late), "LATE", "bafyLate");
    *chain.head.lock().unwrap() = 110;
    engine.poll_once(&hooks).await?;

    let rows = hooks.grants().rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].symbol, "LATE");
    Ok(())
}

#[tokio::test]
async fn half_written_registry_holds_checkpoint_until_readable() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("datasets.json");
    std::fs::write(&path, "")?;

    let hooks = GrantIssuer::new(
        JsonRegistry::new(&path),
        MemGrants::default(),
        GrantSigner::new(SECRET)?,
    );
    let chain = ScriptedChain::new(105, vec![transfer(token(), holder(), Address::ZERO, 500, 103)]);
    let store = Arc::new(MemCheckpoint::at(100));
    let engine = PollEngine::new(store.clone(), chain);

    assert!(engine.poll_once(&hooks).await.is_err());
    assert_eq!(store.get(), Some(100));

    // writer finishes; the same range is scanned and the burn is granted
    std::fs::write(
        &path,
        format!(r#"{{ "{}": {{ "cid": "bafy123", "symbol": "ABC" }} }}"#, lower_hex(&token())),
    )?;
    let outcome = engine.poll_once(&hooks).await?;

    assert_eq!(outcome.scanned, Some((101, 105)));
    assert_eq!(store.get(), Some(105));
    let rows = hooks.grants().rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].symbol, "ABC");
    Ok(())
}

#[tokio::test]
async fn one_broken_registry_record_does_not_stall_other_tokens() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("datasets.json");
    std::fs::write(
        &path,
        format!(
            r#"{{
              "{}": {{ "cid": "bafy123", "symbol": "ABC" }},
              "0x1111111111111111111111111111111111111111": {{ "symbol": "NOCID" }}
            }}"#,
            lower_hex(&token())
        ),
    )?;

    let hooks = GrantIssuer::new(
        JsonRegistry::new(&path),
        MemGrants::default(),
        GrantSigner::new(SECRET)?,
    );
    let chain = ScriptedChain::new(105, vec![transfer(token(), holder(), Address::ZERO, 500, 103)]);
    let engine = PollEngine::new(MemCheckpoint::at(100), chain);

    let outcome = engine.poll_once(&hooks).await?;

    assert_eq!(outcome.checkpoint, 105);
    assert_eq!(outcome.targets, 1);
    assert_eq!(hooks.grants().rows().len(), 1);
    Ok(())
}
