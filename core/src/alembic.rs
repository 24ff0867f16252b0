// ============================================================================
// Alembic Lending Engine
// ============================================================================
//
// Pure pooled-lending state machine: interest-bearing markets, a global risk
// controller, and the Bank that sequences them. No syscalls, no allocation,
// no I/O; the on-chain wrapper owns token transfers, oracle reads and account
// plumbing, and drives this crate through plain method calls.
//
// All state lives in flat fixed-capacity structs so the wrapper can map the
// whole Bank into a zero-copy account. Every operation validates and computes
// first, then commits; a returned error means nothing changed.

#![no_std]
#![forbid(unsafe_code)]

pub mod controller;
pub mod exp;
pub mod market;
pub mod u128;

use exp::{div_scalar_by_exp_truncate, div_exp, mul_exp, mul_scalar_truncate, Exp};
use market::Market;

pub use controller::{EnteredSet, ModerationRecord, ModerationState, RiskController, RiskParams};
pub use market::{initial_exchange_rate_mantissa, Position};
pub use u128::U128;

// ============================================================================
// Capacity Limits
// ============================================================================

/// Maximum registered accounts per Bank.
#[cfg(not(feature = "test"))]
pub const MAX_ACCOUNTS: usize = 256;
/// Reduced capacity so tests can build Banks on the stack.
#[cfg(feature = "test")]
pub const MAX_ACCOUNTS: usize = 64;

/// Maximum listed markets per Bank.
#[cfg(not(feature = "test"))]
pub const MAX_MARKETS: usize = 16;
#[cfg(feature = "test")]
pub const MAX_MARKETS: usize = 8;

/// Hard cap on each account's entered-market set; params.max_assets may be
/// configured lower, never higher.
pub const MAX_ENTERED: usize = 16;

// ============================================================================
// Constants
// ============================================================================

/// 1e18, the fixed-point scale for every stored ratio.
pub const EXP_SCALE: u128 = 1_000_000_000_000_000_000;

/// Claim tokens are normalized to 8 decimals regardless of the underlying.
pub const CLAIM_TOKEN_DECIMALS: u32 = 8;

/// Per-epoch borrow rate ceiling (0.0005% per epoch). A model output above
/// this indicates parameter corruption and fails accrual closed.
pub const BORROW_RATE_MAX_MANTISSA: u128 = 5_000_000_000_000;

// ============================================================================
// Errors
// ============================================================================

/// Arithmetic failure sites. Each fallible computation step carries its own
/// subcode so a failure pinpoints the exact multiplication or sum that
/// overflowed.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MathSub {
    RateCalculation = 0,
    InterestFactor = 1,
    NewBorrowIndex = 2,
    InterestAccumulated = 3,
    NewTotalBorrows = 4,
    NewTotalReserves = 5,
    ExchangeRate = 6,
    BorrowBalance = 7,
    MintShares = 8,
    RedeemAmount = 9,
    LiquiditySum = 10,
    SeizeShares = 11,
    BondAccounting = 12,
    CashDelta = 13,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerError {
    Unauthorized,
    MarketNotListed,
    MarketNotFresh,
    InsufficientLiquidity,
    InsufficientShortfall,
    TooMuchRepay,
    TooManyAssets,
    BorrowPaused,
    BorrowNotStarted,
    PriceUnavailable,
    InsufficientCash,
    TokenInsufficientBalance,
    SnapshotCorrupt,
    SelfTransfer,
    LiquidateSelf,
    LiquidateSeizeTooMuch,
    NonzeroBorrowBalance,
    AbsurdRate,
    InvalidAmount,
    InvalidModerationState,
    ModerationWindowClosed,
    ModerationWindowActive,
    AlreadyClaimed,
    AccountLimitExceeded,
    MarketLimitExceeded,
    AccountNotRegistered,
    Math(MathSub),
}

impl LedgerError {
    /// Stable wire code. Plain errors occupy 1..=26; math errors are
    /// 100 + subcode so the failure site survives into program logs.
    pub const fn code(&self) -> u32 {
        match self {
            LedgerError::Unauthorized => 1,
            LedgerError::MarketNotListed => 2,
            LedgerError::MarketNotFresh => 3,
            LedgerError::InsufficientLiquidity => 4,
            LedgerError::InsufficientShortfall => 5,
            LedgerError::TooMuchRepay => 6,
            LedgerError::TooManyAssets => 7,
            LedgerError::BorrowPaused => 8,
            LedgerError::BorrowNotStarted => 9,
            LedgerError::PriceUnavailable => 10,
            LedgerError::InsufficientCash => 11,
            LedgerError::TokenInsufficientBalance => 12,
            LedgerError::SnapshotCorrupt => 13,
            LedgerError::SelfTransfer => 14,
            LedgerError::LiquidateSelf => 15,
            LedgerError::LiquidateSeizeTooMuch => 16,
            LedgerError::NonzeroBorrowBalance => 17,
            LedgerError::AbsurdRate => 18,
            LedgerError::InvalidAmount => 19,
            LedgerError::InvalidModerationState => 20,
            LedgerError::ModerationWindowClosed => 21,
            LedgerError::ModerationWindowActive => 22,
            LedgerError::AlreadyClaimed => 23,
            LedgerError::AccountLimitExceeded => 24,
            LedgerError::MarketLimitExceeded => 25,
            LedgerError::AccountNotRegistered => 26,
            LedgerError::Math(sub) => 100 + *sub as u32,
        }
    }
}

#[inline]
pub const fn math(sub: MathSub) -> LedgerError {
    LedgerError::Math(sub)
}

pub type Result<T> = core::result::Result<T, LedgerError>;

// ============================================================================
// Traits
// ============================================================================

/// Per-epoch borrow rate from market utilization.
pub trait InterestModel {
    fn borrow_rate(&self, cash: u128, borrows: u128, reserves: u128) -> Result<u128>;
}

/// Underlying price per market, scaled so `price * smallest_units / 1e18`
/// yields a USD value carrying 18 decimals. None means no trustworthy price;
/// every consumer fails closed on it.
pub trait PriceSource {
    fn price_mantissa(&self, market: u16) -> Option<u128>;
}

/// Read-only market surface the controller's liquidity scan consumes.
pub trait MarketView {
    fn exchange_rate_stored(&self) -> Result<u128>;
    fn borrow_balance_stored(&self, account: u16) -> Result<u128>;
    /// (claim shares, current borrow balance, exchange rate mantissa).
    fn account_snapshot(&self, account: u16) -> Result<(u128, u128, u128)>;
}

/// rate = base + multiplier * utilization, all per-epoch 1e18 mantissas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinearRateModel {
    pub base_rate_mantissa: u128,
    pub multiplier_mantissa: u128,
}

impl InterestModel for LinearRateModel {
    fn borrow_rate(&self, cash: u128, borrows: u128, reserves: u128) -> Result<u128> {
        if borrows == 0 {
            return Ok(self.base_rate_mantissa);
        }
        let denom = cash
            .checked_add(borrows)
            .and_then(|v| v.checked_sub(reserves))
            .ok_or_else(|| math(MathSub::RateCalculation))?;
        if denom == 0 {
            return Err(math(MathSub::RateCalculation));
        }
        let utilization = borrows
            .checked_mul(EXP_SCALE)
            .ok_or_else(|| math(MathSub::RateCalculation))?
            / denom;
        mul_scalar_truncate(Exp::new(self.multiplier_mantissa), utilization)
            .map_err(|_| math(MathSub::RateCalculation))?
            .checked_add(self.base_rate_mantissa)
            .ok_or_else(|| math(MathSub::RateCalculation))
    }
}

// ============================================================================
// Operation Outcomes
// ============================================================================
//
// Returned to the wrapper so it can emit events and settle token transfers
// without re-deriving ledger math.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccrueOutcome {
    pub cash_prior: u128,
    pub interest_accumulated: u128,
    pub borrow_index: u128,
    pub total_borrows: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MintOutcome {
    pub mint_amount: u128,
    pub mint_shares: u128,
    pub exchange_rate: u128,
    pub fee_factor: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedeemOutcome {
    pub redeem_amount: u128,
    pub redeem_shares: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BorrowOutcome {
    pub borrow_amount: u128,
    pub account_borrows: u128,
    pub total_borrows: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepayOutcome {
    pub repay_amount: u128,
    pub account_borrows: u128,
    pub total_borrows: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiquidateOutcome {
    pub repay_amount: u128,
    pub seize_shares: u128,
    pub liquidator_shares: u128,
    pub protocol_reserve_amount: u128,
}

// ============================================================================
// Bank
// ============================================================================

/// The whole protocol state: controller, market slab, and the owner registry
/// mapping wrapper pubkeys to dense account indices. Account slots are
/// assigned sequentially and never recycled.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Bank {
    pub controller: RiskController,
    pub markets: [Market; MAX_MARKETS],
    pub account_owners: [[u8; 32]; MAX_ACCOUNTS],
    pub num_markets: u16,
    pub num_accounts: u16,
    pub _padding: [u8; 4],
}

impl Bank {
    /// Stack constructor for host-side tests; on-chain state uses
    /// `init_in_place` over a zeroed account instead.
    pub fn new(params: RiskParams) -> Self {
        let mut bank = Self {
            controller: RiskController::EMPTY,
            markets: [Market::EMPTY; MAX_MARKETS],
            account_owners: [[0; 32]; MAX_ACCOUNTS],
            num_markets: 0,
            num_accounts: 0,
            _padding: [0; 4],
        };
        bank.controller.init_in_place(params);
        bank
    }

    pub fn init_in_place(&mut self, params: RiskParams) {
        self.controller.init_in_place(params);
        for market in self.markets.iter_mut() {
            *market = Market::EMPTY;
        }
        self.account_owners = [[0; 32]; MAX_ACCOUNTS];
        self.num_markets = 0;
        self.num_accounts = 0;
        self._padding = [0; 4];
    }

    // ========================================
    // Account Registry
    // ========================================

    pub fn find_account(&self, owner: &[u8; 32]) -> Option<u16> {
        self.account_owners[..self.num_accounts as usize]
            .iter()
            .position(|o| o == owner)
            .map(|i| i as u16)
    }

    /// Idempotent: an already-registered owner gets its existing index back.
    pub fn register_account(&mut self, owner: [u8; 32]) -> Result<u16> {
        if let Some(idx) = self.find_account(&owner) {
            return Ok(idx);
        }
        let idx = self.num_accounts;
        if idx as usize >= MAX_ACCOUNTS {
            return Err(LedgerError::AccountLimitExceeded);
        }
        self.account_owners[idx as usize] = owner;
        self.num_accounts += 1;
        Ok(idx)
    }

    pub fn account_owner(&self, account: u16) -> Option<&[u8; 32]> {
        if account < self.num_accounts {
            Some(&self.account_owners[account as usize])
        } else {
            None
        }
    }

    fn require_market(&self, market: u16) -> Result<()> {
        if market >= self.num_markets {
            return Err(LedgerError::MarketNotListed);
        }
        Ok(())
    }

    /// Wire-supplied account indices are validated here before they ever
    /// index a position slab or entered set.
    fn require_account(&self, account: u16) -> Result<()> {
        if account >= self.num_accounts {
            return Err(LedgerError::AccountNotRegistered);
        }
        Ok(())
    }

    // ========================================
    // Market Lifecycle
    // ========================================

    /// Permissionless listing. The caller pays the pool creation fee, which
    /// becomes the market's moderation bond, and borrowing opens only after
    /// `borrow_delay` epochs.
    #[allow(clippy::too_many_arguments)]
    pub fn create_market(
        &mut self,
        underlying_decimals: u32,
        reserve_factor: u128,
        base_rate: u128,
        multiplier: u128,
        collateral_factor: u128,
        borrow_delay: u64,
        creation_bond_received: u128,
        now: u64,
    ) -> Result<u16> {
        if creation_bond_received != self.controller.params.pool_creation_fee.get() {
            return Err(LedgerError::InvalidAmount);
        }
        if reserve_factor > EXP_SCALE || underlying_decimals > 18 {
            return Err(LedgerError::InvalidAmount);
        }
        let id = self.num_markets;
        if id as usize >= MAX_MARKETS {
            return Err(LedgerError::MarketLimitExceeded);
        }
        let borrow_start = now
            .checked_add(borrow_delay)
            .ok_or(LedgerError::InvalidAmount)?;

        self.controller
            .list_market(id, collateral_factor, creation_bond_received)?;
        self.markets[id as usize].init(
            underlying_decimals,
            reserve_factor,
            base_rate,
            multiplier,
            borrow_start,
            now,
        );
        self.num_markets += 1;
        Ok(id)
    }

    fn accrue_internal(&mut self, market: u16, now: u64) -> Result<AccrueOutcome> {
        let m = &mut self.markets[market as usize];
        let model = m.rate_model();
        m.accrue(&model, now)
    }

    pub fn accrue_market(&mut self, market: u16, now: u64) -> Result<AccrueOutcome> {
        self.require_market(market)?;
        self.accrue_internal(market, now)
    }

    // ========================================
    // Supply Side
    // ========================================

    pub fn mint(
        &mut self,
        account: u16,
        market: u16,
        requested: u128,
        received: u128,
        now: u64,
    ) -> Result<MintOutcome> {
        self.require_market(market)?;
        self.require_account(account)?;
        self.accrue_internal(market, now)?;
        self.controller.mint_allowed(market)?;
        self.markets[market as usize].mint_fresh(account, requested, received, now)
    }

    pub fn redeem_shares(
        &mut self,
        prices: &impl PriceSource,
        account: u16,
        market: u16,
        shares: u128,
        now: u64,
    ) -> Result<RedeemOutcome> {
        self.require_market(market)?;
        self.require_account(account)?;
        self.accrue_internal(market, now)?;
        self.controller
            .redeem_allowed(&self.markets, prices, market, account, shares)?;
        self.markets[market as usize].redeem_shares_fresh(account, shares, now)
    }

    pub fn redeem_underlying(
        &mut self,
        prices: &impl PriceSource,
        account: u16,
        market: u16,
        amount: u128,
        now: u64,
    ) -> Result<RedeemOutcome> {
        self.require_market(market)?;
        self.require_account(account)?;
        self.accrue_internal(market, now)?;
        let exchange_rate = self.markets[market as usize].exchange_rate_internal()?;
        let shares = div_scalar_by_exp_truncate(amount, exchange_rate)
            .map_err(|_| math(MathSub::RedeemAmount))?;
        self.controller
            .redeem_allowed(&self.markets, prices, market, account, shares)?;
        self.markets[market as usize].redeem_underlying_fresh(account, amount, now)
    }

    // ========================================
    // Borrow Side
    // ========================================

    /// Borrowing auto-enters the market; the hook checks the entered-set cap
    /// and liquidity as-if-entered, so the commit below cannot fail.
    pub fn borrow(
        &mut self,
        prices: &impl PriceSource,
        account: u16,
        market: u16,
        amount: u128,
        now: u64,
    ) -> Result<BorrowOutcome> {
        self.require_market(market)?;
        self.require_account(account)?;
        self.accrue_internal(market, now)?;
        self.controller
            .borrow_allowed(&self.markets, prices, market, account, amount)?;
        let outcome = self.markets[market as usize].borrow_fresh(account, amount, now)?;
        self.controller.enter_market(account, market)?;
        Ok(outcome)
    }

    /// `borrower` may differ from the paying wrapper signer; the ledger only
    /// cares whose debt shrinks and what the vault received.
    pub fn repay(
        &mut self,
        borrower: u16,
        market: u16,
        received: u128,
        now: u64,
    ) -> Result<RepayOutcome> {
        self.require_market(market)?;
        self.require_account(borrower)?;
        self.accrue_internal(market, now)?;
        self.controller.repay_borrow_allowed(market)?;
        self.markets[market as usize].repay_fresh(borrower, received, now)
    }

    // ========================================
    // Liquidation
    // ========================================

    /// seize_shares = repay * incentive * price_debt
    ///              / (price_collateral * exchange_rate_collateral)
    ///
    /// The price ratio is taken first so intermediates stay near 1e18 and
    /// never overflow for realistic price spreads.
    pub fn calculate_seize_shares(
        &self,
        prices: &impl PriceSource,
        debt_market: u16,
        collateral_market: u16,
        repay_amount: u128,
    ) -> Result<u128> {
        let price_debt = prices
            .price_mantissa(debt_market)
            .ok_or(LedgerError::PriceUnavailable)?;
        let price_collateral = prices
            .price_mantissa(collateral_market)
            .ok_or(LedgerError::PriceUnavailable)?;
        let exchange_rate = self.markets[collateral_market as usize].exchange_rate_internal()?;

        let ratio = div_exp(Exp::new(price_debt), Exp::new(price_collateral))
            .and_then(|r| {
                mul_exp(
                    r,
                    Exp::new(self.controller.params.liquidation_incentive.get()),
                )
            })
            .map_err(|_| math(MathSub::SeizeShares))?;
        let per_unit = div_exp(ratio, exchange_rate).map_err(|_| math(MathSub::SeizeShares))?;
        mul_scalar_truncate(per_unit, repay_amount).map_err(|_| math(MathSub::SeizeShares))
    }

    /// Repay on the debt market and seize collateral shares atomically.
    /// Every failure mode is checked before the first commit; the two market
    /// mutations at the end cannot fail independently.
    pub fn liquidate(
        &mut self,
        prices: &impl PriceSource,
        liquidator: u16,
        borrower: u16,
        debt_market: u16,
        collateral_market: u16,
        repay_received: u128,
        now: u64,
    ) -> Result<LiquidateOutcome> {
        if liquidator == borrower {
            return Err(LedgerError::LiquidateSelf);
        }
        if repay_received == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        self.require_market(debt_market)?;
        self.require_market(collateral_market)?;
        self.require_account(liquidator)?;
        self.require_account(borrower)?;

        self.accrue_internal(debt_market, now)?;
        if collateral_market != debt_market {
            self.accrue_internal(collateral_market, now)?;
        }
        self.controller.liquidate_borrow_allowed(
            &self.markets,
            prices,
            debt_market,
            collateral_market,
            borrower,
            repay_received,
        )?;

        let seize_shares =
            self.calculate_seize_shares(prices, debt_market, collateral_market, repay_received)?;
        let borrower_collateral = self.markets[collateral_market as usize].positions
            [borrower as usize]
            .shares
            .get();
        if seize_shares > borrower_collateral {
            return Err(LedgerError::LiquidateSeizeTooMuch);
        }
        self.controller.seize_allowed(debt_market, collateral_market)?;

        let repay =
            self.markets[debt_market as usize].repay_fresh(borrower, repay_received, now)?;
        let protocol_seize_share = Exp::new(self.controller.params.protocol_seize_share.get());
        let (liquidator_shares, protocol_reserve_amount) = self.markets
            [collateral_market as usize]
            .seize_fresh(borrower, liquidator, seize_shares, protocol_seize_share, now)?;

        Ok(LiquidateOutcome {
            repay_amount: repay.repay_amount,
            seize_shares,
            liquidator_shares,
            protocol_reserve_amount,
        })
    }

    // ========================================
    // Claim-Share Transfer
    // ========================================

    /// Claim shares move like any other balance change: interest accrues
    /// first so the shortfall veto sees current borrow indices.
    pub fn transfer_shares(
        &mut self,
        prices: &impl PriceSource,
        from: u16,
        to: u16,
        market: u16,
        shares: u128,
        now: u64,
    ) -> Result<()> {
        self.require_market(market)?;
        self.require_account(from)?;
        self.require_account(to)?;
        self.accrue_internal(market, now)?;
        self.controller
            .transfer_allowed(&self.markets, prices, market, from, shares)?;
        self.markets[market as usize].transfer_shares_fresh(from, to, shares, now)
    }

    // ========================================
    // Membership & Liquidity
    // ========================================

    pub fn enter_market(&mut self, account: u16, market: u16) -> Result<bool> {
        self.require_market(market)?;
        self.require_account(account)?;
        self.controller.enter_market(account, market)
    }

    pub fn exit_market(
        &mut self,
        prices: &impl PriceSource,
        account: u16,
        market: u16,
        now: u64,
    ) -> Result<()> {
        self.require_market(market)?;
        self.require_account(account)?;
        self.accrue_internal(market, now)?;
        self.controller
            .exit_market_allowed(&self.markets, prices, market, account)?;
        self.controller.remove_entered(account, market);
        Ok(())
    }

    /// (liquidity, shortfall) with every entered market accrued to `now`
    /// first, so moderation-era debt cannot hide behind a stale index.
    pub fn account_liquidity(
        &mut self,
        prices: &impl PriceSource,
        account: u16,
        now: u64,
    ) -> Result<(u128, u128)> {
        self.require_account(account)?;
        let entered = self.controller.entered[account as usize];
        for &m in entered.as_slice() {
            self.accrue_internal(m, now)?;
        }
        self.controller
            .account_liquidity(&self.markets, prices, account)
    }

    // ========================================
    // Reserves & Admin
    // ========================================

    fn require_admin(&self, caller: [u8; 32]) -> Result<()> {
        if caller != self.controller.params.admin {
            return Err(LedgerError::Unauthorized);
        }
        Ok(())
    }

    /// Anyone may donate to reserves. Returns the new reserve total.
    pub fn add_reserves(&mut self, market: u16, received: u128, now: u64) -> Result<u128> {
        self.require_market(market)?;
        self.accrue_internal(market, now)?;
        self.markets[market as usize].add_reserves_fresh(received, now)
    }

    /// Admin withdraws reserves to the fee sink. Returns the new total.
    pub fn reduce_reserves(
        &mut self,
        caller: [u8; 32],
        market: u16,
        amount: u128,
        now: u64,
    ) -> Result<u128> {
        self.require_admin(caller)?;
        self.require_market(market)?;
        self.accrue_internal(market, now)?;
        self.markets[market as usize].reduce_reserves_fresh(amount, now)
    }

    pub fn set_reserve_factor(
        &mut self,
        caller: [u8; 32],
        market: u16,
        mantissa: u128,
        now: u64,
    ) -> Result<()> {
        self.require_admin(caller)?;
        self.require_market(market)?;
        self.accrue_internal(market, now)?;
        self.markets[market as usize].set_reserve_factor_fresh(mantissa, now)
    }

    /// Swap rate-model parameters; interest up to `now` accrues under the
    /// old model first.
    pub fn set_rate_params(
        &mut self,
        caller: [u8; 32],
        market: u16,
        base_rate: u128,
        multiplier: u128,
        now: u64,
    ) -> Result<()> {
        self.require_admin(caller)?;
        self.require_market(market)?;
        self.accrue_internal(market, now)?;
        let m = &mut self.markets[market as usize];
        m.base_rate = U128::new(base_rate);
        m.multiplier = U128::new(multiplier);
        Ok(())
    }

    // ========================================
    // Moderation
    // ========================================

    pub fn flag_market(
        &mut self,
        caller: [u8; 32],
        market: u16,
        deposit_received: u128,
        now: u64,
    ) -> Result<u128> {
        self.controller
            .flag_market(&self.markets, caller, market, deposit_received, now)
    }

    pub fn guardian_reject(&mut self, caller: [u8; 32], market: u16, now: u64) -> Result<()> {
        self.controller
            .guardian_reject(&self.markets, caller, market, now)
    }

    pub fn harvest_unused_reward(&mut self, market: u16, now: u64) -> Result<u128> {
        self.controller
            .harvest_unused_reward(&self.markets, market, now)
    }

    pub fn claim_moderation_reward(
        &mut self,
        caller: [u8; 32],
        market: u16,
        now: u64,
    ) -> Result<u128> {
        self.controller
            .claim_moderation_reward(&self.markets, caller, market, now)
    }
}
