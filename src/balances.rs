use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{TokenAmount, NATIVE_DECIMALS};
use crate::rpc::LedgerRpc;
use crate::units::to_human_units;

/// Best-effort display balances. `None` means unavailable, not zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balances {
    pub native_lamports: Option<u64>,
    pub token: Option<TokenAmount>,
}

impl Balances {
    pub fn native_sol(&self) -> Option<String> {
        self.native_lamports.map(|l| to_human_units(l, NATIVE_DECIMALS))
    }

    pub fn token_ui(&self) -> Option<String> {
        self.token.map(|t| to_human_units(t.amount, t.decimals))
    }
}

/// Associated token account for (owner, mint) under the classic SPL token program.
pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    spl_associated_token_account::get_associated_token_address(owner, mint)
}

/// Native balance whenever there is an identity, token balance only when a mint is given.
///
/// A missing token account reads as zero. Any other RPC failure blanks both
/// balances; it is logged and never returned.
pub async fn resolve(rpc: &dyn LedgerRpc, identity: Option<&Pubkey>, token: Option<&str>) -> Balances {
    let Some(owner) = identity else {
        return Balances::default();
    };

    let native_lamports = match rpc.get_balance(owner).await {
        Ok(lamports) => lamports,
        Err(e) => {
            warn!(owner = %owner, error = %e, endpoint = rpc.endpoint(), "balances.native_failed");
            return Balances::default();
        }
    };

    let token = token.map(str::trim).filter(|t| !t.is_empty());
    let Some(mint_raw) = token else {
        return Balances { native_lamports: Some(native_lamports), token: None };
    };
    let Ok(mint) = Pubkey::from_str(mint_raw) else {
        debug!(mint = mint_raw, "balances.invalid_mint");
        return Balances { native_lamports: Some(native_lamports), token: None };
    };

    let ata = associated_token_address(owner, &mint);
    let token = match rpc.get_token_account_balance(&ata).await {
        Ok(Some(amount)) => amount,
        Ok(None) => {
            // No account yet: zero. Decimals only matter for display.
            let decimals = rpc.get_token_decimals(mint_raw).await.unwrap_or(0);
            TokenAmount { amount: 0, decimals }
        }
        Err(e) => {
            warn!(owner = %owner, mint = mint_raw, ata = %ata, error = %e, "balances.token_failed");
            return Balances::default();
        }
    };

    Balances { native_lamports: Some(native_lamports), token: Some(token) }
}

type BalanceKey = (Option<Pubkey>, Option<String>);

#[derive(Default)]
struct BalanceState {
    generation: u64,
    key: Option<BalanceKey>,
    balances: Balances,
}

/// Keeps the last resolved balances and refetches when identity or token changes.
#[derive(Default)]
pub struct BalanceResolver {
    state: Mutex<BalanceState>,
}

impl BalanceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Balances {
        self.state.lock().await.balances
    }

    /// Refetches only when (identity, token) differs from the last request.
    pub async fn refresh_if_changed(&self, rpc: Arc<dyn LedgerRpc>, identity: Option<Pubkey>, token: Option<String>) -> Balances {
        {
            let state = self.state.lock().await;
            if state.key.as_ref() == Some(&(identity, token.clone())) {
                return state.balances;
            }
        }
        self.refresh(rpc, identity, token).await
    }

    /// Always refetches. A result overtaken by a newer refresh is discarded.
    pub async fn refresh(&self, rpc: Arc<dyn LedgerRpc>, identity: Option<Pubkey>, token: Option<String>) -> Balances {
        let generation = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.key = Some((identity, token.clone()));
            state.generation
        };

        let balances = resolve(rpc.as_ref(), identity.as_ref(), token.as_deref()).await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            debug!(generation, latest = state.generation, "balances.stale_result_dropped");
            return state.balances;
        }
        state.balances = balances;
        balances
    }
}
