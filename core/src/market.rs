// ============================================================================
// Market Ledger
// ============================================================================
//
// One `Market` per listed underlying asset: the interest-bearing supply and
// borrow ledger. Methods suffixed `_fresh` refuse to run unless interest has
// been accrued for the current epoch; the `Bank` enforces that ordering and
// runs the Risk Controller hooks before any of them execute.
//
// Every operation computes all fallible arithmetic first and only then writes
// state, so a failing call leaves the market untouched.

use crate::exp::{
    add_exp, div_scalar_by_exp_truncate, mul_scalar, mul_scalar_truncate,
    mul_scalar_truncate_add, Exp,
};
use crate::u128::U128;
use crate::{
    math, AccrueOutcome, BorrowOutcome, InterestModel, LedgerError, LinearRateModel,
    MarketView, MathSub, MintOutcome, RedeemOutcome, RepayOutcome, Result,
    BORROW_RATE_MAX_MANTISSA, CLAIM_TOKEN_DECIMALS, EXP_SCALE, MAX_ACCOUNTS,
};

/// Per-account state within one market.
///
/// `principal` is the borrow balance recorded at `interest_index`; the
/// current debt is `principal * borrow_index / interest_index`. Both fields
/// are zero together or non-zero together — any other combination is an
/// invariant violation and borrow-balance reads fail on it.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    pub shares: U128,
    pub principal: U128,
    pub interest_index: U128,
}

impl Position {
    const EMPTY: Self = Self {
        shares: U128::ZERO,
        principal: U128::ZERO,
        interest_index: U128::ZERO,
    };
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Market {
    pub total_supply_shares: U128,
    pub total_borrows: U128,
    pub total_reserves: U128,
    /// Ledger-held underlying amount. The wrapper mirrors this in the
    /// market's vault token account; conservation between the two is a test
    /// invariant.
    pub cash: U128,

    /// Monotonically non-decreasing interest index, 1e18 scale.
    pub borrow_index: U128,
    /// Epoch of the last interest accrual.
    pub accrual_epoch: u64,
    /// Borrowing is disallowed before this epoch (cooling-off after listing).
    pub borrow_start_epoch: u64,

    /// Fraction of accrued interest retained as reserves, 1e18 scale.
    pub reserve_factor: U128,
    /// Observed transfer-fee ratio of the underlying token, 1e18 scale.
    /// Zero until a fee is first detected; derived once from the first
    /// observed transfer-in shortfall and then left alone.
    pub fee_factor: U128,
    /// Exchange rate used while total_supply_shares == 0, scaled for the
    /// underlying's decimal count.
    pub initial_exchange_rate: U128,

    /// Interest model parameters (per-epoch 1e18 mantissas).
    pub base_rate: U128,
    pub multiplier: U128,

    pub underlying_decimals: u32,
    pub _padding: u32,

    pub positions: [Position; MAX_ACCOUNTS],
}

/// Initial exchange rate compensating for the underlying's decimal count so
/// claim-token precision is normalized to CLAIM_TOKEN_DECIMALS:
/// 0.02 * 10^(18 + decimals - CLAIM_TOKEN_DECIMALS).
pub fn initial_exchange_rate_mantissa(underlying_decimals: u32) -> u128 {
    let exponent = 18 + underlying_decimals - CLAIM_TOKEN_DECIMALS;
    2 * 10u128.pow(exponent - 2)
}

impl Market {
    pub const EMPTY: Self = Self {
        total_supply_shares: U128::ZERO,
        total_borrows: U128::ZERO,
        total_reserves: U128::ZERO,
        cash: U128::ZERO,
        borrow_index: U128::ZERO,
        accrual_epoch: 0,
        borrow_start_epoch: 0,
        reserve_factor: U128::ZERO,
        fee_factor: U128::ZERO,
        initial_exchange_rate: U128::ZERO,
        base_rate: U128::ZERO,
        multiplier: U128::ZERO,
        underlying_decimals: 0,
        _padding: 0,
        positions: [Position::EMPTY; MAX_ACCOUNTS],
    };

    pub fn init(
        &mut self,
        underlying_decimals: u32,
        reserve_factor: u128,
        base_rate: u128,
        multiplier: u128,
        borrow_start_epoch: u64,
        now: u64,
    ) {
        self.total_supply_shares = U128::ZERO;
        self.total_borrows = U128::ZERO;
        self.total_reserves = U128::ZERO;
        self.cash = U128::ZERO;
        self.borrow_index = U128::new(EXP_SCALE);
        self.accrual_epoch = now;
        self.borrow_start_epoch = borrow_start_epoch;
        self.reserve_factor = U128::new(reserve_factor);
        self.fee_factor = U128::ZERO;
        self.initial_exchange_rate =
            U128::new(initial_exchange_rate_mantissa(underlying_decimals));
        self.base_rate = U128::new(base_rate);
        self.multiplier = U128::new(multiplier);
        self.underlying_decimals = underlying_decimals;
        self._padding = 0;
        self.positions = [Position::EMPTY; MAX_ACCOUNTS];
    }

    pub fn rate_model(&self) -> LinearRateModel {
        LinearRateModel {
            base_rate_mantissa: self.base_rate.get(),
            multiplier_mantissa: self.multiplier.get(),
        }
    }

    /// Fails with MARKET_NOT_FRESH unless accrual has run this epoch.
    pub fn assert_fresh(&self, now: u64) -> Result<()> {
        if self.accrual_epoch != now {
            return Err(LedgerError::MarketNotFresh);
        }
        Ok(())
    }

    // ========================================
    // Interest Accrual
    // ========================================

    /// Advance the borrow index and totals to `now`. No-op when already
    /// accrued this epoch. Each multiplication surfaces its own MATH_ERROR
    /// subcode on overflow.
    pub fn accrue(&mut self, model: &impl InterestModel, now: u64) -> Result<AccrueOutcome> {
        let cash_prior = self.cash.get();
        let borrows_prior = self.total_borrows.get();
        let reserves_prior = self.total_reserves.get();
        let index_prior = self.borrow_index.get();

        if self.accrual_epoch == now {
            return Ok(AccrueOutcome {
                cash_prior,
                interest_accumulated: 0,
                borrow_index: index_prior,
                total_borrows: borrows_prior,
            });
        }
        let delta = now
            .checked_sub(self.accrual_epoch)
            .ok_or(LedgerError::InvalidAmount)?;

        let rate = model.borrow_rate(cash_prior, borrows_prior, reserves_prior)?;
        if rate > BORROW_RATE_MAX_MANTISSA {
            return Err(LedgerError::AbsurdRate);
        }

        let interest_factor = mul_scalar(Exp::new(rate), delta as u128)
            .map_err(|_| math(MathSub::InterestFactor))?;
        let interest_accumulated = mul_scalar_truncate(interest_factor, borrows_prior)
            .map_err(|_| math(MathSub::InterestAccumulated))?;
        let total_borrows_new = borrows_prior
            .checked_add(interest_accumulated)
            .ok_or_else(|| math(MathSub::NewTotalBorrows))?;
        let total_reserves_new = mul_scalar_truncate_add(
            Exp::new(self.reserve_factor.get()),
            interest_accumulated,
            reserves_prior,
        )
        .map_err(|_| math(MathSub::NewTotalReserves))?;
        let borrow_index_new = mul_scalar_truncate_add(interest_factor, index_prior, index_prior)
            .map_err(|_| math(MathSub::NewBorrowIndex))?;

        self.accrual_epoch = now;
        self.borrow_index.set(borrow_index_new);
        self.total_borrows.set(total_borrows_new);
        self.total_reserves.set(total_reserves_new);

        Ok(AccrueOutcome {
            cash_prior,
            interest_accumulated,
            borrow_index: borrow_index_new,
            total_borrows: total_borrows_new,
        })
    }

    // ========================================
    // Stored Views
    // ========================================

    /// Exchange rate from stored state: (cash + borrows - reserves) / shares,
    /// or the configured initial rate while no shares exist.
    pub fn exchange_rate_internal(&self) -> Result<Exp> {
        let shares = self.total_supply_shares.get();
        if shares == 0 {
            return Ok(Exp::new(self.initial_exchange_rate.get()));
        }
        let pooled = self
            .cash
            .get()
            .checked_add(self.total_borrows.get())
            .and_then(|v| v.checked_sub(self.total_reserves.get()))
            .ok_or_else(|| math(MathSub::ExchangeRate))?;
        let mantissa = pooled
            .checked_mul(EXP_SCALE)
            .ok_or_else(|| math(MathSub::ExchangeRate))?
            / shares;
        Ok(Exp::new(mantissa))
    }

    /// Current debt from the stored snapshot against the stored borrow index.
    pub fn borrow_balance_internal(&self, account: u16) -> Result<u128> {
        let position = &self.positions[account as usize];
        let principal = position.principal.get();
        let snapshot_index = position.interest_index.get();
        // A half-written snapshot must fail loudly, never read plausibly.
        if (principal == 0) != (snapshot_index == 0) {
            return Err(LedgerError::SnapshotCorrupt);
        }
        if principal == 0 {
            return Ok(0);
        }
        let scaled = principal
            .checked_mul(self.borrow_index.get())
            .ok_or_else(|| math(MathSub::BorrowBalance))?;
        Ok(scaled / snapshot_index)
    }

    // ========================================
    // Supply Side
    // ========================================

    /// Credit a deposit. `requested` is what the supplier asked to move;
    /// `received` is what the vault actually gained (less for
    /// fee-on-transfer underlyings). Shares are always derived from
    /// `received`, and the first observed shortfall fixes `fee_factor`.
    pub fn mint_fresh(
        &mut self,
        account: u16,
        requested: u128,
        received: u128,
        now: u64,
    ) -> Result<MintOutcome> {
        self.assert_fresh(now)?;
        let fee_factor_new = self.observed_transfer_fee(requested, received)?;

        let exchange_rate = self.exchange_rate_internal()?;
        let mint_shares = div_scalar_by_exp_truncate(received, exchange_rate)
            .map_err(|_| math(MathSub::MintShares))?;

        let cash_new = self
            .cash
            .get()
            .checked_add(received)
            .ok_or_else(|| math(MathSub::CashDelta))?;
        let total_shares_new = self
            .total_supply_shares
            .get()
            .checked_add(mint_shares)
            .ok_or_else(|| math(MathSub::MintShares))?;
        let account_shares_new = self.positions[account as usize]
            .shares
            .get()
            .checked_add(mint_shares)
            .ok_or_else(|| math(MathSub::MintShares))?;

        self.cash.set(cash_new);
        self.total_supply_shares.set(total_shares_new);
        self.positions[account as usize].shares.set(account_shares_new);
        if let Some(fee) = fee_factor_new {
            self.fee_factor.set(fee);
        }

        Ok(MintOutcome {
            mint_amount: received,
            mint_shares,
            exchange_rate: exchange_rate.mantissa,
            fee_factor: self.fee_factor.get(),
        })
    }

    /// Fee factor to record, if this transfer is the first to show one.
    fn observed_transfer_fee(&self, requested: u128, received: u128) -> Result<Option<u128>> {
        if received == 0 || received > requested {
            return Err(LedgerError::InvalidAmount);
        }
        if received < requested && self.fee_factor.is_zero() {
            let shortfall = requested - received;
            let fee = shortfall
                .checked_mul(EXP_SCALE)
                .ok_or_else(|| math(MathSub::CashDelta))?
                / requested;
            return Ok(Some(fee));
        }
        Ok(None)
    }

    /// Redeem an exact number of shares; `redeem_amount` is what the wrapper
    /// must transfer out afterwards.
    pub fn redeem_shares_fresh(
        &mut self,
        account: u16,
        shares: u128,
        now: u64,
    ) -> Result<RedeemOutcome> {
        self.assert_fresh(now)?;
        let exchange_rate = self.exchange_rate_internal()?;
        let amount = mul_scalar_truncate(exchange_rate, shares)
            .map_err(|_| math(MathSub::RedeemAmount))?;
        self.redeem_commit(account, shares, amount)
    }

    /// Redeem enough shares to release an exact underlying amount.
    pub fn redeem_underlying_fresh(
        &mut self,
        account: u16,
        amount: u128,
        now: u64,
    ) -> Result<RedeemOutcome> {
        self.assert_fresh(now)?;
        let exchange_rate = self.exchange_rate_internal()?;
        let shares = div_scalar_by_exp_truncate(amount, exchange_rate)
            .map_err(|_| math(MathSub::RedeemAmount))?;
        self.redeem_commit(account, shares, amount)
    }

    fn redeem_commit(&mut self, account: u16, shares: u128, amount: u128) -> Result<RedeemOutcome> {
        if shares == 0 && amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let account_shares = self.positions[account as usize].shares.get();
        let account_shares_new = account_shares
            .checked_sub(shares)
            .ok_or(LedgerError::TokenInsufficientBalance)?;
        let total_shares_new = self
            .total_supply_shares
            .get()
            .checked_sub(shares)
            .ok_or(LedgerError::TokenInsufficientBalance)?;
        let cash_new = self
            .cash
            .get()
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientCash)?;

        self.positions[account as usize].shares.set(account_shares_new);
        self.total_supply_shares.set(total_shares_new);
        self.cash.set(cash_new);

        Ok(RedeemOutcome {
            redeem_amount: amount,
            redeem_shares: shares,
        })
    }

    // ========================================
    // Borrow Side
    // ========================================

    pub fn borrow_fresh(&mut self, account: u16, amount: u128, now: u64) -> Result<BorrowOutcome> {
        self.assert_fresh(now)?;
        if now < self.borrow_start_epoch {
            return Err(LedgerError::BorrowNotStarted);
        }
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let cash_new = self
            .cash
            .get()
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientCash)?;
        let debt_prior = self.borrow_balance_internal(account)?;
        let debt_new = debt_prior
            .checked_add(amount)
            .ok_or_else(|| math(MathSub::BorrowBalance))?;
        let total_borrows_new = self
            .total_borrows
            .get()
            .checked_add(amount)
            .ok_or_else(|| math(MathSub::NewTotalBorrows))?;

        let position = &mut self.positions[account as usize];
        position.principal.set(debt_new);
        position.interest_index.set(self.borrow_index.get());
        self.total_borrows.set(total_borrows_new);
        self.cash.set(cash_new);

        Ok(BorrowOutcome {
            borrow_amount: amount,
            account_borrows: debt_new,
            total_borrows: total_borrows_new,
        })
    }

    /// Credit a repayment. The amount credited against debt is what the
    /// vault actually received, never the requested amount.
    pub fn repay_fresh(&mut self, borrower: u16, received: u128, now: u64) -> Result<RepayOutcome> {
        self.assert_fresh(now)?;
        if received == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let debt = self.borrow_balance_internal(borrower)?;
        let debt_new = debt.checked_sub(received).ok_or(LedgerError::TooMuchRepay)?;
        let total_borrows_new = self
            .total_borrows
            .get()
            .checked_sub(received)
            .ok_or_else(|| math(MathSub::NewTotalBorrows))?;
        let cash_new = self
            .cash
            .get()
            .checked_add(received)
            .ok_or_else(|| math(MathSub::CashDelta))?;

        let position = &mut self.positions[borrower as usize];
        position.principal.set(debt_new);
        position
            .interest_index
            .set(if debt_new == 0 { 0 } else { self.borrow_index.get() });
        self.total_borrows.set(total_borrows_new);
        self.cash.set(cash_new);

        Ok(RepayOutcome {
            repay_amount: received,
            account_borrows: debt_new,
            total_borrows: total_borrows_new,
        })
    }

    // ========================================
    // Reserves
    // ========================================

    /// Credit a reserve donation; returns the new reserve total.
    pub fn add_reserves_fresh(&mut self, received: u128, now: u64) -> Result<u128> {
        self.assert_fresh(now)?;
        if received == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let reserves_new = self
            .total_reserves
            .get()
            .checked_add(received)
            .ok_or_else(|| math(MathSub::NewTotalReserves))?;
        let cash_new = self
            .cash
            .get()
            .checked_add(received)
            .ok_or_else(|| math(MathSub::CashDelta))?;

        self.total_reserves.set(reserves_new);
        self.cash.set(cash_new);
        Ok(reserves_new)
    }

    /// Release reserves for withdrawal; returns the new reserve total. The
    /// wrapper transfers `amount` out of the vault afterwards.
    pub fn reduce_reserves_fresh(&mut self, amount: u128, now: u64) -> Result<u128> {
        self.assert_fresh(now)?;
        let reserves_new = self
            .total_reserves
            .get()
            .checked_sub(amount)
            .ok_or(LedgerError::InvalidAmount)?;
        let cash_new = self
            .cash
            .get()
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientCash)?;

        self.total_reserves.set(reserves_new);
        self.cash.set(cash_new);
        Ok(reserves_new)
    }

    pub fn set_reserve_factor_fresh(&mut self, mantissa: u128, now: u64) -> Result<()> {
        self.assert_fresh(now)?;
        if mantissa > EXP_SCALE {
            return Err(LedgerError::InvalidAmount);
        }
        self.reserve_factor.set(mantissa);
        Ok(())
    }

    // ========================================
    // Seize / Transfer
    // ========================================

    /// Move seized collateral shares from borrower to liquidator, retaining
    /// the protocol share as reserves. Returns (liquidator shares, protocol
    /// reserve amount).
    pub fn seize_fresh(
        &mut self,
        borrower: u16,
        liquidator: u16,
        seize_shares: u128,
        protocol_seize_share: Exp,
        now: u64,
    ) -> Result<(u128, u128)> {
        self.assert_fresh(now)?;
        let protocol_shares = mul_scalar_truncate(protocol_seize_share, seize_shares)
            .map_err(|_| math(MathSub::SeizeShares))?;
        let liquidator_shares = seize_shares
            .checked_sub(protocol_shares)
            .ok_or_else(|| math(MathSub::SeizeShares))?;
        let exchange_rate = self.exchange_rate_internal()?;
        let protocol_amount = mul_scalar_truncate(exchange_rate, protocol_shares)
            .map_err(|_| math(MathSub::SeizeShares))?;

        let borrower_shares_new = self.positions[borrower as usize]
            .shares
            .get()
            .checked_sub(seize_shares)
            .ok_or(LedgerError::TokenInsufficientBalance)?;
        let liquidator_shares_new = self.positions[liquidator as usize]
            .shares
            .get()
            .checked_add(liquidator_shares)
            .ok_or_else(|| math(MathSub::SeizeShares))?;
        let total_shares_new = self
            .total_supply_shares
            .get()
            .checked_sub(protocol_shares)
            .ok_or_else(|| math(MathSub::SeizeShares))?;
        let reserves_new = add_exp(
            Exp::new(self.total_reserves.get()),
            Exp::new(protocol_amount),
        )
        .map_err(|_| math(MathSub::NewTotalReserves))?
        .mantissa;

        self.positions[borrower as usize].shares.set(borrower_shares_new);
        self.positions[liquidator as usize]
            .shares
            .set(liquidator_shares_new);
        self.total_supply_shares.set(total_shares_new);
        self.total_reserves.set(reserves_new);

        Ok((liquidator_shares, protocol_amount))
    }

    pub fn transfer_shares_fresh(
        &mut self,
        from: u16,
        to: u16,
        shares: u128,
        now: u64,
    ) -> Result<()> {
        self.assert_fresh(now)?;
        if from == to {
            return Err(LedgerError::SelfTransfer);
        }
        if shares == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let from_new = self.positions[from as usize]
            .shares
            .get()
            .checked_sub(shares)
            .ok_or(LedgerError::TokenInsufficientBalance)?;
        let to_new = self.positions[to as usize]
            .shares
            .get()
            .checked_add(shares)
            .ok_or_else(|| math(MathSub::CashDelta))?;

        self.positions[from as usize].shares.set(from_new);
        self.positions[to as usize].shares.set(to_new);
        Ok(())
    }
}

impl MarketView for Market {
    fn exchange_rate_stored(&self) -> Result<u128> {
        Ok(self.exchange_rate_internal()?.mantissa)
    }

    fn borrow_balance_stored(&self, account: u16) -> Result<u128> {
        self.borrow_balance_internal(account)
    }

    fn account_snapshot(&self, account: u16) -> Result<(u128, u128, u128)> {
        let shares = self.positions[account as usize].shares.get();
        let borrow = self.borrow_balance_internal(account)?;
        let rate = self.exchange_rate_internal()?.mantissa;
        Ok((shares, borrow, rate))
    }
}
