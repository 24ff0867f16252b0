// ============================================================================
// Risk Controller
// ============================================================================
//
// The single global gatekeeper: market registry, collateral factors, the
// per-account entered-market sets that scope the liquidity scan, the action
// gating hooks every ledger mutation passes through, and the market
// moderation bond state machine.
//
// Hooks take `&[Market]` and compute hypothetical positions from stored
// state, so they never mutate a market and cannot observe pre-accrual state
// mid-operation: the Bank accrues the touched market before calling them.

use crate::exp::{mul_exp, mul_scalar_truncate, Exp};
use crate::market::Market;
use crate::u128::U128;
use crate::{
    math, LedgerError, MarketView, MathSub, PriceSource, Result, EXP_SCALE, MAX_ACCOUNTS,
    MAX_ENTERED, MAX_MARKETS,
};

/// Collateral factors above 90% are rejected outright.
pub const COLLATERAL_FACTOR_MAX_MANTISSA: u128 = 900_000_000_000_000_000;
/// Close factor must stay within [5%, 90%].
pub const CLOSE_FACTOR_MIN_MANTISSA: u128 = 50_000_000_000_000_000;
pub const CLOSE_FACTOR_MAX_MANTISSA: u128 = 900_000_000_000_000_000;
/// Liquidation incentive must stay within [1.0, 1.5].
pub const LIQUIDATION_INCENTIVE_MIN_MANTISSA: u128 = EXP_SCALE;
pub const LIQUIDATION_INCENTIVE_MAX_MANTISSA: u128 = 1_500_000_000_000_000_000;

pub const MARKET_BITMAP_WORDS: usize = (MAX_MARKETS + 63) / 64;

/// Moderation dispute lifecycle for a market's creation bond.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModerationState {
    /// No dispute raised.
    None = 0,
    /// A user flagged the market and posted the pause deposit.
    Paused = 1,
    /// The pause guardian overruled the flag within the window.
    Rejected = 2,
    /// The flag stood unchallenged; the flagger claimed the bond.
    Confirmed = 3,
    /// Undisputed (or overruled) bond swept to the fee sink.
    Settled = 4,
}

/// One per market, created at listing; lives for the market's whole life.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModerationRecord {
    pub bond: U128,
    pub bond_holder: [u8; 32],
    pub state: ModerationState,
    pub _padding: [u8; 7],
}

impl ModerationRecord {
    pub const EMPTY: Self = Self {
        bond: U128::ZERO,
        bond_holder: [0; 32],
        state: ModerationState::None,
        _padding: [0; 7],
    };
}

/// Global risk parameters (spec singleton).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RiskParams {
    /// Max fraction of a borrow repayable per liquidation call, 1e18.
    pub close_factor: U128,
    /// Bonus multiplier paid to liquidators, 1e18 (>= 1.0).
    pub liquidation_incentive: U128,
    /// Fraction of seized collateral retained as reserves, 1e18.
    pub protocol_seize_share: U128,
    /// Deposit a flagger must post to pause a market.
    pub user_pause_deposit: U128,
    /// Bond the factory pays at market creation.
    pub pool_creation_fee: U128,
    /// Cap on each account's entered-market set.
    pub max_assets: u16,
    pub _padding: [u8; 6],
    /// Moderation window length in epochs past borrow_start_epoch.
    pub guardian_moderate_time: u64,
    pub admin: [u8; 32],
    pub pause_guardian: [u8; 32],
}

impl RiskParams {
    pub const EMPTY: Self = Self {
        close_factor: U128::ZERO,
        liquidation_incentive: U128::ZERO,
        protocol_seize_share: U128::ZERO,
        user_pause_deposit: U128::ZERO,
        pool_creation_fee: U128::ZERO,
        max_assets: 0,
        _padding: [0; 6],
        guardian_moderate_time: 0,
        admin: [0; 32],
        pause_guardian: [0; 32],
    };
}

/// Order-preserving entered-market list. Insertion appends if absent;
/// removal shifts the tail down so relative order of survivors is stable.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnteredSet {
    pub ids: [u16; MAX_ENTERED],
    pub len: u16,
}

impl EnteredSet {
    pub const EMPTY: Self = Self {
        ids: [0; MAX_ENTERED],
        len: 0,
    };

    pub fn as_slice(&self) -> &[u16] {
        &self.ids[..self.len as usize]
    }

    pub fn contains(&self, market: u16) -> bool {
        self.as_slice().iter().any(|&m| m == market)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RiskController {
    pub params: RiskParams,
    /// Controller-owned, keyed by market.
    pub collateral_factor: [U128; MAX_MARKETS],
    pub listed: [u64; MARKET_BITMAP_WORDS],
    pub borrow_paused: [u64; MARKET_BITMAP_WORDS],
    pub moderation: [ModerationRecord; MAX_MARKETS],
    /// Sum of all bonds/deposits locked by open moderation disputes.
    pub total_frozen: U128,
    /// Settled bonds queued for transfer to the protocol fee sink.
    pub pending_sweep: U128,
    pub entered: [EnteredSet; MAX_ACCOUNTS],
}

impl RiskController {
    pub const EMPTY: Self = Self {
        params: RiskParams::EMPTY,
        collateral_factor: [U128::ZERO; MAX_MARKETS],
        listed: [0; MARKET_BITMAP_WORDS],
        borrow_paused: [0; MARKET_BITMAP_WORDS],
        moderation: [ModerationRecord::EMPTY; MAX_MARKETS],
        total_frozen: U128::ZERO,
        pending_sweep: U128::ZERO,
        entered: [EnteredSet::EMPTY; MAX_ACCOUNTS],
    };

    pub fn init_in_place(&mut self, params: RiskParams) {
        self.params = params;
        self.collateral_factor = [U128::ZERO; MAX_MARKETS];
        self.listed = [0; MARKET_BITMAP_WORDS];
        self.borrow_paused = [0; MARKET_BITMAP_WORDS];
        self.moderation = [ModerationRecord::EMPTY; MAX_MARKETS];
        self.total_frozen = U128::ZERO;
        self.pending_sweep = U128::ZERO;
        self.entered = [EnteredSet::EMPTY; MAX_ACCOUNTS];
    }

    // ========================================
    // Registry Bitmaps
    // ========================================

    pub fn is_listed(&self, market: u16) -> bool {
        let idx = market as usize;
        idx < MAX_MARKETS && (self.listed[idx >> 6] >> (idx & 63)) & 1 == 1
    }

    fn set_listed_bit(&mut self, market: u16, on: bool) {
        let idx = market as usize;
        if on {
            self.listed[idx >> 6] |= 1u64 << (idx & 63);
        } else {
            self.listed[idx >> 6] &= !(1u64 << (idx & 63));
        }
    }

    pub fn is_borrow_paused(&self, market: u16) -> bool {
        let idx = market as usize;
        idx < MAX_MARKETS && (self.borrow_paused[idx >> 6] >> (idx & 63)) & 1 == 1
    }

    fn set_borrow_paused_bit(&mut self, market: u16, on: bool) {
        let idx = market as usize;
        if on {
            self.borrow_paused[idx >> 6] |= 1u64 << (idx & 63);
        } else {
            self.borrow_paused[idx >> 6] &= !(1u64 << (idx & 63));
        }
    }

    fn require_listed(&self, market: u16) -> Result<()> {
        if !self.is_listed(market) {
            return Err(LedgerError::MarketNotListed);
        }
        Ok(())
    }

    /// Register a newly created market: collateral factor, listing bit and
    /// the moderation record holding the factory's creation bond.
    pub fn list_market(
        &mut self,
        market: u16,
        collateral_factor: u128,
        creation_bond: u128,
    ) -> Result<()> {
        if collateral_factor > COLLATERAL_FACTOR_MAX_MANTISSA {
            return Err(LedgerError::InvalidAmount);
        }
        if self.is_listed(market) {
            return Err(LedgerError::InvalidAmount);
        }
        let frozen_new = self
            .total_frozen
            .checked_add(creation_bond)
            .ok_or_else(|| math(MathSub::BondAccounting))?;

        self.collateral_factor[market as usize] = U128::new(collateral_factor);
        self.moderation[market as usize] = ModerationRecord {
            bond: U128::new(creation_bond),
            bond_holder: [0; 32],
            state: ModerationState::None,
            _padding: [0; 7],
        };
        self.total_frozen = frozen_new;
        self.set_listed_bit(market, true);
        Ok(())
    }

    // ========================================
    // Entered-Market Sets
    // ========================================

    pub fn entered_markets(&self, account: u16) -> &[u16] {
        self.entered[account as usize].as_slice()
    }

    pub fn is_entered(&self, account: u16, market: u16) -> bool {
        self.entered[account as usize].contains(market)
    }

    /// Idempotent, order-preserving insert. Returns true when newly added.
    pub fn enter_market(&mut self, account: u16, market: u16) -> Result<bool> {
        self.require_listed(market)?;
        let set = &mut self.entered[account as usize];
        if set.contains(market) {
            return Ok(false);
        }
        let len = set.len as usize;
        if len >= self.params.max_assets as usize || len >= MAX_ENTERED {
            return Err(LedgerError::TooManyAssets);
        }
        set.ids[len] = market;
        set.len += 1;
        Ok(true)
    }

    /// Stable-order removal: survivors keep their relative order.
    pub fn remove_entered(&mut self, account: u16, market: u16) -> bool {
        let set = &mut self.entered[account as usize];
        let len = set.len as usize;
        let Some(pos) = set.as_slice().iter().position(|&m| m == market) else {
            return false;
        };
        set.ids.copy_within(pos + 1..len, pos);
        set.ids[len - 1] = 0;
        set.len -= 1;
        true
    }

    // ========================================
    // Liquidity
    // ========================================

    /// (liquidity, shortfall) over the account's entered markets; exactly
    /// one of the two is non-zero. Stored values only — callers accrue
    /// whatever freshness they need first.
    pub fn account_liquidity(
        &self,
        markets: &[Market],
        prices: &impl PriceSource,
        account: u16,
    ) -> Result<(u128, u128)> {
        self.hypothetical_liquidity(markets, prices, account, u16::MAX, 0, 0)
    }

    /// Liquidity as if `account` had already redeemed `redeem_shares` and
    /// borrowed `borrow_amount` in `modify_market` (u16::MAX = no
    /// modification). A not-yet-entered modify market contributes only its
    /// hypothetical borrow, never collateral.
    pub fn hypothetical_liquidity(
        &self,
        markets: &[Market],
        prices: &impl PriceSource,
        account: u16,
        modify_market: u16,
        redeem_shares: u128,
        borrow_amount: u128,
    ) -> Result<(u128, u128)> {
        let mut sum_collateral: u128 = 0;
        let mut sum_debt: u128 = 0;
        let mut modify_seen = false;

        for &m in self.entered_markets(account) {
            let market = &markets[m as usize];
            let (shares, borrow, exchange_rate) = market.account_snapshot(account)?;
            let price = prices
                .price_mantissa(m)
                .ok_or(LedgerError::PriceUnavailable)?;

            // collateral weight per share = collateral_factor * exchange_rate * price
            let weighted = mul_exp(
                Exp::new(self.collateral_factor[m as usize].get()),
                Exp::new(exchange_rate),
            )
            .and_then(|e| mul_exp(e, Exp::new(price)))
            .map_err(|_| math(MathSub::LiquiditySum))?;

            sum_collateral = mul_scalar_truncate(weighted, shares)
                .and_then(|v| {
                    v.checked_add(sum_collateral)
                        .ok_or(crate::exp::MathError::Overflow)
                })
                .map_err(|_| math(MathSub::LiquiditySum))?;
            sum_debt = mul_scalar_truncate(Exp::new(price), borrow)
                .and_then(|v| {
                    v.checked_add(sum_debt)
                        .ok_or(crate::exp::MathError::Overflow)
                })
                .map_err(|_| math(MathSub::LiquiditySum))?;

            if m == modify_market {
                modify_seen = true;
                sum_debt = mul_scalar_truncate(weighted, redeem_shares)
                    .and_then(|v| {
                        mul_scalar_truncate(Exp::new(price), borrow_amount)
                            .map(|b| (v, b))
                    })
                    .and_then(|(v, b)| {
                        sum_debt
                            .checked_add(v)
                            .and_then(|s| s.checked_add(b))
                            .ok_or(crate::exp::MathError::Overflow)
                    })
                    .map_err(|_| math(MathSub::LiquiditySum))?;
            }
        }

        if modify_market != u16::MAX && !modify_seen && borrow_amount > 0 {
            let price = prices
                .price_mantissa(modify_market)
                .ok_or(LedgerError::PriceUnavailable)?;
            sum_debt = mul_scalar_truncate(Exp::new(price), borrow_amount)
                .and_then(|v| {
                    v.checked_add(sum_debt)
                        .ok_or(crate::exp::MathError::Overflow)
                })
                .map_err(|_| math(MathSub::LiquiditySum))?;
        }

        if sum_collateral >= sum_debt {
            Ok((sum_collateral - sum_debt, 0))
        } else {
            Ok((0, sum_debt - sum_collateral))
        }
    }

    // ========================================
    // Gating Hooks
    // ========================================

    pub fn mint_allowed(&self, market: u16) -> Result<()> {
        self.require_listed(market)
    }

    pub fn redeem_allowed(
        &self,
        markets: &[Market],
        prices: &impl PriceSource,
        market: u16,
        account: u16,
        redeem_shares: u128,
    ) -> Result<()> {
        self.require_listed(market)?;
        // An account that never entered the market has no borrowing power
        // tied to it; redeeming cannot create a shortfall.
        if !self.is_entered(account, market) {
            return Ok(());
        }
        let (_, shortfall) =
            self.hypothetical_liquidity(markets, prices, account, market, redeem_shares, 0)?;
        if shortfall > 0 {
            return Err(LedgerError::InsufficientLiquidity);
        }
        Ok(())
    }

    /// Checks only; the Bank commits the auto-enter after this succeeds.
    pub fn borrow_allowed(
        &self,
        markets: &[Market],
        prices: &impl PriceSource,
        market: u16,
        account: u16,
        amount: u128,
    ) -> Result<()> {
        self.require_listed(market)?;
        if self.is_borrow_paused(market) {
            return Err(LedgerError::BorrowPaused);
        }
        if !self.is_entered(account, market) {
            let len = self.entered[account as usize].len as usize;
            if len >= self.params.max_assets as usize || len >= MAX_ENTERED {
                return Err(LedgerError::TooManyAssets);
            }
        }
        if prices.price_mantissa(market).is_none() {
            return Err(LedgerError::PriceUnavailable);
        }
        let (_, shortfall) =
            self.hypothetical_liquidity(markets, prices, account, market, 0, amount)?;
        if shortfall > 0 {
            return Err(LedgerError::InsufficientLiquidity);
        }
        Ok(())
    }

    pub fn repay_borrow_allowed(&self, market: u16) -> Result<()> {
        self.require_listed(market)
    }

    pub fn liquidate_borrow_allowed(
        &self,
        markets: &[Market],
        prices: &impl PriceSource,
        debt_market: u16,
        collateral_market: u16,
        borrower: u16,
        repay_amount: u128,
    ) -> Result<()> {
        self.require_listed(debt_market)?;
        self.require_listed(collateral_market)?;
        let (_, shortfall) = self.account_liquidity(markets, prices, borrower)?;
        if shortfall == 0 {
            return Err(LedgerError::InsufficientShortfall);
        }
        let debt = markets[debt_market as usize].borrow_balance_stored(borrower)?;
        let max_close = mul_scalar_truncate(Exp::new(self.params.close_factor.get()), debt)
            .map_err(|_| math(MathSub::LiquiditySum))?;
        if repay_amount > max_close {
            return Err(LedgerError::TooMuchRepay);
        }
        Ok(())
    }

    pub fn seize_allowed(&self, debt_market: u16, collateral_market: u16) -> Result<()> {
        self.require_listed(debt_market)?;
        self.require_listed(collateral_market)
    }

    pub fn transfer_allowed(
        &self,
        markets: &[Market],
        prices: &impl PriceSource,
        market: u16,
        from: u16,
        shares: u128,
    ) -> Result<()> {
        self.redeem_allowed(markets, prices, market, from, shares)
    }

    /// Exit is refused while the account still owes anything in the market.
    pub fn exit_market_allowed(
        &self,
        markets: &[Market],
        prices: &impl PriceSource,
        market: u16,
        account: u16,
    ) -> Result<()> {
        let (shares, borrow, _) = markets[market as usize].account_snapshot(account)?;
        if borrow != 0 {
            return Err(LedgerError::NonzeroBorrowBalance);
        }
        self.redeem_allowed(markets, prices, market, account, shares)
    }

    // ========================================
    // Moderation State Machine
    // ========================================

    fn moderation_deadline(&self, market: &Market) -> u64 {
        market
            .borrow_start_epoch
            .saturating_add(self.params.guardian_moderate_time)
    }

    /// NONE -> PAUSED: any account may flag a fresh market by posting the
    /// pause deposit; borrowing pauses immediately.
    pub fn flag_market(
        &mut self,
        markets: &[Market],
        caller: [u8; 32],
        market: u16,
        deposit_received: u128,
        now: u64,
    ) -> Result<u128> {
        self.require_listed(market)?;
        let record = self.moderation[market as usize];
        if record.state != ModerationState::None {
            return Err(LedgerError::InvalidModerationState);
        }
        if now >= self.moderation_deadline(&markets[market as usize]) {
            return Err(LedgerError::ModerationWindowClosed);
        }
        if deposit_received != self.params.user_pause_deposit.get() {
            return Err(LedgerError::InvalidAmount);
        }
        let bond_new = record
            .bond
            .checked_add(deposit_received)
            .ok_or_else(|| math(MathSub::BondAccounting))?;
        let frozen_new = self
            .total_frozen
            .checked_add(deposit_received)
            .ok_or_else(|| math(MathSub::BondAccounting))?;

        let record = &mut self.moderation[market as usize];
        record.state = ModerationState::Paused;
        record.bond = bond_new;
        record.bond_holder = caller;
        self.total_frozen = frozen_new;
        self.set_borrow_paused_bit(market, true);
        Ok(deposit_received)
    }

    /// PAUSED -> REJECTED: the guardian overrules the flag in-window and
    /// borrowing resumes.
    pub fn guardian_reject(
        &mut self,
        markets: &[Market],
        caller: [u8; 32],
        market: u16,
        now: u64,
    ) -> Result<()> {
        if caller != self.params.pause_guardian {
            return Err(LedgerError::Unauthorized);
        }
        self.require_listed(market)?;
        if self.moderation[market as usize].state != ModerationState::Paused {
            return Err(LedgerError::InvalidModerationState);
        }
        if now >= self.moderation_deadline(&markets[market as usize]) {
            return Err(LedgerError::ModerationWindowClosed);
        }
        self.moderation[market as usize].state = ModerationState::Rejected;
        self.set_borrow_paused_bit(market, false);
        Ok(())
    }

    /// NONE/REJECTED -> SETTLED after the window: the bond (plus any
    /// overruled flag deposit) unfreezes and queues for the fee sink.
    pub fn harvest_unused_reward(
        &mut self,
        markets: &[Market],
        market: u16,
        now: u64,
    ) -> Result<u128> {
        self.require_listed(market)?;
        let record = self.moderation[market as usize];
        match record.state {
            ModerationState::None | ModerationState::Rejected => {}
            _ => return Err(LedgerError::InvalidModerationState),
        }
        if now <= self.moderation_deadline(&markets[market as usize]) {
            return Err(LedgerError::ModerationWindowActive);
        }
        let amount = record.bond.get();
        let frozen_new = self
            .total_frozen
            .checked_sub(amount)
            .ok_or_else(|| math(MathSub::BondAccounting))?;
        let sweep_new = self
            .pending_sweep
            .checked_add(amount)
            .ok_or_else(|| math(MathSub::BondAccounting))?;

        let record = &mut self.moderation[market as usize];
        record.bond = U128::ZERO;
        record.state = ModerationState::Settled;
        self.total_frozen = frozen_new;
        self.pending_sweep = sweep_new;
        Ok(amount)
    }

    /// PAUSED -> CONFIRMED after the window: the unchallenged flagger is
    /// paid the whole bond exactly once.
    pub fn claim_moderation_reward(
        &mut self,
        markets: &[Market],
        caller: [u8; 32],
        market: u16,
        now: u64,
    ) -> Result<u128> {
        self.require_listed(market)?;
        let record = self.moderation[market as usize];
        match record.state {
            ModerationState::Paused => {}
            ModerationState::Confirmed => return Err(LedgerError::AlreadyClaimed),
            _ => return Err(LedgerError::InvalidModerationState),
        }
        if now <= self.moderation_deadline(&markets[market as usize]) {
            return Err(LedgerError::ModerationWindowActive);
        }
        if caller != record.bond_holder {
            return Err(LedgerError::Unauthorized);
        }
        let amount = record.bond.get();
        let frozen_new = self
            .total_frozen
            .checked_sub(amount)
            .ok_or_else(|| math(MathSub::BondAccounting))?;

        let record = &mut self.moderation[market as usize];
        record.bond = U128::ZERO;
        record.state = ModerationState::Confirmed;
        self.total_frozen = frozen_new;
        Ok(amount)
    }

    /// Drain the fee-sink queue; the caller transfers the returned amount.
    pub fn take_pending_sweep(&mut self) -> u128 {
        let amount = self.pending_sweep.get();
        self.pending_sweep = U128::ZERO;
        amount
    }

    // ========================================
    // Admin
    // ========================================

    fn require_admin(&self, caller: [u8; 32]) -> Result<()> {
        if caller != self.params.admin {
            return Err(LedgerError::Unauthorized);
        }
        Ok(())
    }

    pub fn set_close_factor(&mut self, caller: [u8; 32], mantissa: u128) -> Result<()> {
        self.require_admin(caller)?;
        if !(CLOSE_FACTOR_MIN_MANTISSA..=CLOSE_FACTOR_MAX_MANTISSA).contains(&mantissa) {
            return Err(LedgerError::InvalidAmount);
        }
        self.params.close_factor = U128::new(mantissa);
        Ok(())
    }

    pub fn set_liquidation_incentive(&mut self, caller: [u8; 32], mantissa: u128) -> Result<()> {
        self.require_admin(caller)?;
        if !(LIQUIDATION_INCENTIVE_MIN_MANTISSA..=LIQUIDATION_INCENTIVE_MAX_MANTISSA)
            .contains(&mantissa)
        {
            return Err(LedgerError::InvalidAmount);
        }
        self.params.liquidation_incentive = U128::new(mantissa);
        Ok(())
    }

    pub fn set_collateral_factor(
        &mut self,
        caller: [u8; 32],
        prices: &impl PriceSource,
        market: u16,
        mantissa: u128,
    ) -> Result<()> {
        self.require_admin(caller)?;
        self.require_listed(market)?;
        if mantissa > COLLATERAL_FACTOR_MAX_MANTISSA {
            return Err(LedgerError::InvalidAmount);
        }
        // A non-zero factor without a price would let worthless collateral
        // count toward borrowing power.
        if mantissa != 0 && prices.price_mantissa(market).is_none() {
            return Err(LedgerError::PriceUnavailable);
        }
        self.collateral_factor[market as usize] = U128::new(mantissa);
        Ok(())
    }

    pub fn set_max_assets(&mut self, caller: [u8; 32], max_assets: u16) -> Result<()> {
        self.require_admin(caller)?;
        if max_assets as usize > MAX_ENTERED {
            return Err(LedgerError::InvalidAmount);
        }
        self.params.max_assets = max_assets;
        Ok(())
    }

    pub fn set_pause_guardian(&mut self, caller: [u8; 32], guardian: [u8; 32]) -> Result<()> {
        self.require_admin(caller)?;
        self.params.pause_guardian = guardian;
        Ok(())
    }

    /// Freeze or unfreeze new entries to a market without destroying
    /// history; markets are never deleted.
    pub fn set_market_listed(&mut self, caller: [u8; 32], market: u16, listed: bool) -> Result<()> {
        self.require_admin(caller)?;
        self.set_listed_bit(market, listed);
        Ok(())
    }
}
