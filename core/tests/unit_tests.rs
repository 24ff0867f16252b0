//! Fast unit tests for the lending engine
//! Run with: cargo test

use alembic::exp::{
    add_exp, div_exp, div_scalar_by_exp_truncate, mul_exp, mul_scalar, mul_scalar_truncate,
    mul_scalar_truncate_add, sub_exp, Exp, MathError,
};
use alembic::*;

const ADMIN: [u8; 32] = [7; 32];
const GUARDIAN: [u8; 32] = [9; 32];

// Default market shape: 6-decimal underlying, 10% reserve factor, flat
// 1e12/epoch base rate, 90% collateral factor.
const RESERVE_FACTOR: u128 = 100_000_000_000_000_000;
const BASE_RATE: u128 = 1_000_000_000_000;
const COLLATERAL_FACTOR: u128 = 900_000_000_000_000_000;
const CREATION_FEE: u128 = 5_000;
const PAUSE_DEPOSIT: u128 = 1_000;
const MODERATE_TIME: u64 = 100;

// ==============================================================================
// DETERMINISTIC PRNG FOR FUZZ TESTS
// ==============================================================================

/// Simple xorshift64 PRNG for deterministic fuzz testing
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Rng(seed)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn u64(&mut self, lo: u64, hi: u64) -> u64 {
        if lo >= hi {
            return lo;
        }
        lo + (self.next() % (hi - lo + 1))
    }

    fn u128(&mut self, lo: u128, hi: u128) -> u128 {
        if lo >= hi {
            return lo;
        }
        lo + (self.next() as u128 % (hi - lo + 1))
    }
}

fn default_params() -> RiskParams {
    RiskParams {
        close_factor: U128::new(500_000_000_000_000_000), // 50%
        liquidation_incentive: U128::new(1_080_000_000_000_000_000), // 1.08x
        protocol_seize_share: U128::new(100_000_000_000_000_000), // 10%
        user_pause_deposit: U128::new(PAUSE_DEPOSIT),
        pool_creation_fee: U128::new(CREATION_FEE),
        max_assets: 8,
        _padding: [0; 6],
        guardian_moderate_time: MODERATE_TIME,
        admin: ADMIN,
        pause_guardian: GUARDIAN,
    }
}

// ==============================================================================
// TEST HELPERS
// ==============================================================================

/// Price mantissa for a USD quote in 1e6 precision against an underlying
/// with the given decimal count, matching the wrapper's oracle scaling.
fn usd_price(price_e6: u128, decimals: u32) -> u128 {
    price_e6 * 10u128.pow(30 - decimals)
}

struct FixedPrices([Option<u128>; MAX_MARKETS]);

impl FixedPrices {
    fn one_dollar() -> Self {
        FixedPrices([Some(usd_price(1_000_000, 6)); MAX_MARKETS])
    }

    fn set(&mut self, market: u16, price: Option<u128>) {
        self.0[market as usize] = price;
    }
}

impl PriceSource for FixedPrices {
    fn price_mantissa(&self, market: u16) -> Option<u128> {
        self.0[market as usize]
    }
}

fn new_bank() -> Box<Bank> {
    Box::new(Bank::new(default_params()))
}

fn list_usd_market(bank: &mut Bank, now: u64) -> u16 {
    bank.create_market(
        6,
        RESERVE_FACTOR,
        BASE_RATE,
        0,
        COLLATERAL_FACTOR,
        0,
        CREATION_FEE,
        now,
    )
    .unwrap()
}

fn register(bank: &mut Bank, tag: u8) -> u16 {
    bank.register_account([tag; 32]).unwrap()
}

fn assert_share_conservation(bank: &Bank, market: u16) {
    let m = &bank.markets[market as usize];
    let sum: u128 = m.positions.iter().map(|p| p.shares.get()).sum();
    assert_eq!(
        sum,
        m.total_supply_shares.get(),
        "position shares out of sync with total supply"
    );
}

// ==============================================================================
// FIXED-POINT MATH
// ==============================================================================

#[test]
fn test_exp_add_sub_mul() {
    let a = Exp::new(3 * EXP_SCALE / 2); // 1.5
    let b = Exp::new(2 * EXP_SCALE); // 2.0

    assert_eq!(add_exp(a, b).unwrap().mantissa, 7 * EXP_SCALE / 2);
    assert_eq!(sub_exp(b, a).unwrap().mantissa, EXP_SCALE / 2);
    assert_eq!(sub_exp(a, b), Err(MathError::Overflow));
    assert_eq!(mul_exp(a, b).unwrap().mantissa, 3 * EXP_SCALE);

    // 1.5 * 3 = 4.5, truncates to 4 whole units
    assert_eq!(mul_scalar_truncate(a, 3).unwrap(), 4);
    assert_eq!(mul_scalar(a, 3).unwrap().mantissa, 9 * EXP_SCALE / 2);
    assert_eq!(mul_scalar_truncate_add(a, 3, 10).unwrap(), 14);
}

#[test]
fn test_exp_division() {
    let one = Exp::new(EXP_SCALE);
    let three = Exp::new(3 * EXP_SCALE);

    assert_eq!(div_exp(one, three).unwrap().mantissa, 333_333_333_333_333_333);
    assert_eq!(div_exp(one, Exp::ZERO), Err(MathError::DivisionByZero));
    assert_eq!(div_scalar_by_exp_truncate(10, three).unwrap(), 3);
    assert_eq!(
        div_scalar_by_exp_truncate(10, Exp::ZERO),
        Err(MathError::DivisionByZero)
    );
}

#[test]
fn test_exp_wide_products_divide_down() {
    // Products beyond u128 are fine as long as the quotient fits: a full
    // 1e30-scale price times a large unit count stays exact.
    let price = Exp::new(1_000_000 * 10u128.pow(24)); // $1.00, 6-dec scaling
    assert_eq!(
        mul_scalar_truncate(price, 1_000_000_000_000).unwrap(),
        10u128.pow(24)
    );
    // Dividing one 1e30-scale price by another lands back near 1e18.
    let discounted = Exp::new(900_000 * 10u128.pow(24));
    assert_eq!(
        div_exp(price, discounted).unwrap().mantissa,
        1_111_111_111_111_111_111
    );
    let huge = Exp::new(u128::MAX);
    assert_eq!(
        mul_scalar_truncate(huge, 2).unwrap(),
        u128::MAX / (EXP_SCALE / 2)
    );
}

#[test]
fn test_exp_overflow_is_detected() {
    // Overflow now means the quotient itself cannot fit in a u128.
    let huge = Exp::new(u128::MAX);
    assert_eq!(
        mul_scalar_truncate(huge, 2 * EXP_SCALE),
        Err(MathError::Overflow)
    );
    assert_eq!(add_exp(huge, Exp::ONE), Err(MathError::Overflow));
    assert_eq!(
        div_exp(huge, Exp::new(EXP_SCALE / 2)),
        Err(MathError::Overflow)
    );
    assert_eq!(mul_scalar(huge, 2), Err(MathError::Overflow));
}

#[test]
fn test_u128_storage_layout() {
    // The whole point of U128 is 8-byte alignment on every target.
    assert_eq!(core::mem::size_of::<U128>(), 16);
    assert_eq!(core::mem::align_of::<U128>(), 8);

    let v = U128::new(u128::MAX - 7);
    assert_eq!(v.get(), u128::MAX - 7);
    assert_eq!(U128::MAX.checked_add(1), None);
    assert_eq!(U128::ZERO.checked_sub(1), None);
    assert!(U128::ZERO.is_zero());
    assert!(U128::new(1) > U128::ZERO);
    assert_eq!(U128::new(5).saturating_sub(9), U128::ZERO);
}

#[test]
fn test_initial_exchange_rate_scaling() {
    // 0.02 * 10^(18 + decimals - 8)
    assert_eq!(initial_exchange_rate_mantissa(6), 200_000_000_000_000);
    assert_eq!(initial_exchange_rate_mantissa(8), 20_000_000_000_000_000);
    assert_eq!(initial_exchange_rate_mantissa(0), 200_000_000);
    assert_eq!(
        initial_exchange_rate_mantissa(18),
        200_000_000_000_000_000_000_000_000
    );
}

#[test]
fn test_linear_rate_model() {
    let model = LinearRateModel {
        base_rate_mantissa: 1_000_000_000,
        multiplier_mantissa: 4_000_000_000,
    };

    // No borrows: flat base rate, no division.
    assert_eq!(model.borrow_rate(0, 0, 0).unwrap(), 1_000_000_000);

    // utilization = 1e6 / (3e6 + 1e6 - 0) = 25%
    assert_eq!(
        model.borrow_rate(3_000_000, 1_000_000, 0).unwrap(),
        2_000_000_000
    );

    // Zero denominator with live borrows is parameter corruption.
    assert_eq!(
        model.borrow_rate(0, 1_000_000, 1_000_000),
        Err(LedgerError::Math(MathSub::RateCalculation))
    );
}

// ==============================================================================
// INTEREST ACCRUAL
// ==============================================================================

#[test]
fn test_accrue_advances_index_borrows_and_reserves() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.borrow(&prices, user, market, 500_000, 100).unwrap();

    // rate 1e12/epoch over 1000 epochs: factor 1e15, interest 500 on 5e5.
    let outcome = bank.accrue_market(market, 1100).unwrap();
    assert_eq!(outcome.interest_accumulated, 500);
    assert_eq!(outcome.total_borrows, 500_500);
    assert_eq!(outcome.borrow_index, 1_001_000_000_000_000_000);

    let m = &bank.markets[market as usize];
    assert_eq!(m.total_reserves.get(), 50); // 10% of interest
    assert_eq!(m.accrual_epoch, 1100);
}

#[test]
fn test_accrue_is_noop_within_epoch() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.borrow(&prices, user, market, 500_000, 100).unwrap();
    bank.accrue_market(market, 1100).unwrap();

    let index = bank.markets[market as usize].borrow_index.get();
    let again = bank.accrue_market(market, 1100).unwrap();
    assert_eq!(again.interest_accumulated, 0);
    assert_eq!(again.borrow_index, index);
}

#[test]
fn test_accrue_compounds_across_periods() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.borrow(&prices, user, market, 500_000, 100).unwrap();

    bank.accrue_market(market, 1100).unwrap();
    let second = bank.accrue_market(market, 2100).unwrap();

    // Second period charges interest on 500_500 against index 1.001e18.
    assert_eq!(second.interest_accumulated, 500);
    assert_eq!(second.total_borrows, 501_000);
    assert_eq!(second.borrow_index, 1_002_001_000_000_000_000);
}

#[test]
fn test_stale_market_refuses_balance_changes() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let other = register(&mut bank, 2);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.borrow(&prices, user, market, 100_000, 100).unwrap();

    // Last accrual was at epoch 100; every state-changing path must
    // refuse to run against the stale index.
    let m = &mut bank.markets[market as usize];
    assert_eq!(
        m.mint_fresh(user, 1_000, 1_000, 500),
        Err(LedgerError::MarketNotFresh)
    );
    assert_eq!(
        m.redeem_shares_fresh(user, 1_000, 500),
        Err(LedgerError::MarketNotFresh)
    );
    assert_eq!(
        m.borrow_fresh(user, 1_000, 500),
        Err(LedgerError::MarketNotFresh)
    );
    assert_eq!(
        m.repay_fresh(user, 1_000, 500),
        Err(LedgerError::MarketNotFresh)
    );
    assert_eq!(
        m.transfer_shares_fresh(user, other, 1_000, 500),
        Err(LedgerError::MarketNotFresh)
    );

    // Accruing to the current epoch reopens the market.
    let model = m.rate_model();
    m.accrue(&model, 500).unwrap();
    m.mint_fresh(user, 1_000, 1_000, 500).unwrap();
}

#[test]
fn test_accrue_rejects_absurd_rate() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = bank
        .create_market(
            6,
            RESERVE_FACTOR,
            BORROW_RATE_MAX_MANTISSA + 1,
            0,
            COLLATERAL_FACTOR,
            0,
            CREATION_FEE,
            100,
        )
        .unwrap();
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    assert_eq!(
        bank.accrue_market(market, 200),
        Err(LedgerError::AbsurdRate)
    );
    // Everything downstream of accrual fails closed too.
    assert_eq!(
        bank.borrow(&prices, user, market, 1, 200),
        Err(LedgerError::AbsurdRate)
    );
}

#[test]
fn test_borrow_balance_tracks_index() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.borrow(&prices, user, market, 500_000, 100).unwrap();
    bank.accrue_market(market, 1100).unwrap();

    let m = &bank.markets[market as usize];
    assert_eq!(m.borrow_balance_stored(user).unwrap(), 500_500);
    // Untouched accounts owe nothing.
    assert_eq!(m.borrow_balance_stored(user + 1).unwrap(), 0);
}

#[test]
fn test_half_written_snapshot_fails_loudly() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);

    let m = &mut bank.markets[market as usize];
    m.positions[user as usize].principal.set(1_000);
    // interest_index left at zero: must never read as a plausible balance.
    assert_eq!(
        m.borrow_balance_stored(user),
        Err(LedgerError::SnapshotCorrupt)
    );
}

// ==============================================================================
// SUPPLY SIDE
// ==============================================================================

#[test]
fn test_mint_shares_at_initial_rate() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);

    let outcome = bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    assert_eq!(outcome.mint_shares, 5_000_000_000);
    assert_eq!(outcome.exchange_rate, 200_000_000_000_000);
    assert_eq!(outcome.fee_factor, 0);

    let m = &bank.markets[market as usize];
    assert_eq!(m.cash.get(), 1_000_000);
    assert_eq!(m.total_supply_shares.get(), 5_000_000_000);
    assert_share_conservation(&bank, market);
}

#[test]
fn test_fee_on_transfer_recorded_once() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);

    // First shortfall fixes the fee factor: 100/1000 = 10%.
    let first = bank.mint(user, market, 1_000, 900, 100).unwrap();
    assert_eq!(first.fee_factor, 100_000_000_000_000_000);
    assert_eq!(first.mint_shares, 900 * EXP_SCALE / 200_000_000_000_000);

    // Later shortfalls, even different ones, leave it untouched.
    let second = bank.mint(user, market, 1_000, 950, 100).unwrap();
    assert_eq!(second.fee_factor, 100_000_000_000_000_000);

    assert_eq!(
        bank.mint(user, market, 1_000, 0, 100),
        Err(LedgerError::InvalidAmount)
    );
    assert_eq!(
        bank.mint(user, market, 1_000, 1_001, 100),
        Err(LedgerError::InvalidAmount)
    );
}

#[test]
fn test_redeem_shares_and_underlying_agree() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();

    let by_shares = bank
        .redeem_shares(&prices, user, market, 1_000_000_000, 100)
        .unwrap();
    assert_eq!(by_shares.redeem_amount, 200_000);

    let by_amount = bank
        .redeem_underlying(&prices, user, market, 200_000, 100)
        .unwrap();
    assert_eq!(by_amount.redeem_shares, 1_000_000_000);

    let m = &bank.markets[market as usize];
    assert_eq!(m.cash.get(), 600_000);
    assert_eq!(m.positions[user as usize].shares.get(), 3_000_000_000);
    assert_share_conservation(&bank, market);
}

#[test]
fn test_redeem_rejects_bad_amounts() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();

    assert_eq!(
        bank.redeem_shares(&prices, user, market, 0, 100),
        Err(LedgerError::InvalidAmount)
    );
    assert_eq!(
        bank.redeem_shares(&prices, user, market, 6_000_000_000, 100),
        Err(LedgerError::TokenInsufficientBalance)
    );
}

#[test]
fn test_redeem_blocked_by_outstanding_borrows() {
    let mut bank = new_bank();
    let whale = register(&mut bank, 1);
    let user = register(&mut bank, 2);
    let m0 = list_usd_market(&mut bank, 100);
    let m1 = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(whale, m1, 2_000_000, 2_000_000, 100).unwrap();
    bank.mint(user, m0, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, m0).unwrap();
    bank.borrow(&prices, user, m1, 800_000, 100).unwrap();

    // Pulling all collateral would leave $0.80 of naked debt.
    assert_eq!(
        bank.redeem_shares(&prices, user, m0, 5_000_000_000, 100),
        Err(LedgerError::InsufficientLiquidity)
    );
    // A sliver that keeps the position collateralized is fine.
    bank.redeem_shares(&prices, user, m0, 100_000_000, 100)
        .unwrap();
}

// ==============================================================================
// BORROW SIDE
// ==============================================================================

#[test]
fn test_borrow_respects_collateral_factor() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();

    // $1 of collateral at 90% supports exactly $0.90 of debt.
    assert_eq!(
        bank.borrow(&prices, user, market, 900_001, 100),
        Err(LedgerError::InsufficientLiquidity)
    );
    let outcome = bank.borrow(&prices, user, market, 900_000, 100).unwrap();
    assert_eq!(outcome.account_borrows, 900_000);
}

#[test]
fn test_borrow_gated_by_start_epoch() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = bank
        .create_market(
            6,
            RESERVE_FACTOR,
            BASE_RATE,
            0,
            COLLATERAL_FACTOR,
            50,
            CREATION_FEE,
            100,
        )
        .unwrap();
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();

    assert_eq!(
        bank.borrow(&prices, user, market, 1_000, 120),
        Err(LedgerError::BorrowNotStarted)
    );
    bank.borrow(&prices, user, market, 1_000, 150).unwrap();
}

#[test]
fn test_borrow_auto_enters_market() {
    let mut bank = new_bank();
    let whale = register(&mut bank, 1);
    let user = register(&mut bank, 2);
    let m0 = list_usd_market(&mut bank, 100);
    let m1 = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(whale, m1, 2_000_000, 2_000_000, 100).unwrap();
    bank.mint(user, m0, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, m0).unwrap();

    assert!(!bank.controller.is_entered(user, m1));
    bank.borrow(&prices, user, m1, 100_000, 100).unwrap();
    assert_eq!(bank.controller.entered_markets(user), &[m0, m1]);
}

#[test]
fn test_borrow_fails_without_cash_or_price() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let mut prices = FixedPrices::one_dollar();

    bank.mint(user, market, 100_000, 100_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();

    assert_eq!(
        bank.borrow(&prices, user, market, 200_000, 100),
        Err(LedgerError::InsufficientLiquidity)
    );

    prices.set(market, None);
    assert_eq!(
        bank.borrow(&prices, user, market, 1, 100),
        Err(LedgerError::PriceUnavailable)
    );
}

#[test]
fn test_repay_clears_snapshot_exactly_once() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.borrow(&prices, user, market, 500_000, 100).unwrap();

    assert_eq!(
        bank.repay(user, market, 500_001, 100),
        Err(LedgerError::TooMuchRepay)
    );

    let partial = bank.repay(user, market, 200_000, 100).unwrap();
    assert_eq!(partial.account_borrows, 300_000);

    let full = bank.repay(user, market, 300_000, 100).unwrap();
    assert_eq!(full.account_borrows, 0);
    assert_eq!(full.total_borrows, 0);

    let position = &bank.markets[market as usize].positions[user as usize];
    assert!(position.principal.is_zero());
    assert!(position.interest_index.is_zero());
}

// ==============================================================================
// LIQUIDATION
// ==============================================================================

/// Underwater borrower: $1 of m0 collateral at 90%, $0.90 of m1 debt, then
/// the collateral price drops. Returns (bank, prices, user, whale, m0, m1).
fn underwater_setup(
    collateral_price_e6: u128,
) -> (Box<Bank>, FixedPrices, u16, u16, u16, u16) {
    let mut bank = new_bank();
    let whale = register(&mut bank, 1);
    let user = register(&mut bank, 2);
    let m0 = list_usd_market(&mut bank, 100);
    let m1 = list_usd_market(&mut bank, 100);
    let mut prices = FixedPrices::one_dollar();

    bank.mint(whale, m1, 2_000_000, 2_000_000, 100).unwrap();
    bank.mint(user, m0, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, m0).unwrap();
    bank.borrow(&prices, user, m1, 900_000, 100).unwrap();

    prices.set(m0, Some(usd_price(collateral_price_e6, 6)));
    (bank, prices, user, whale, m0, m1)
}

#[test]
fn test_seize_share_calculation() {
    let (bank, prices, _, _, m0, m1) = underwater_setup(900_000);

    // repay * incentive * (price_debt / price_coll) / exchange_rate
    // = 450_000 * 1.08 * (1 / 0.9) / 2e-4 shares, floor-truncated.
    let seize = bank
        .calculate_seize_shares(&prices, m1, m0, 450_000)
        .unwrap();
    assert_eq!(seize, 2_699_999_999);
}

#[test]
fn test_liquidation_splits_seizure_with_protocol() {
    let (mut bank, prices, user, whale, m0, m1) = underwater_setup(900_000);

    let outcome = bank
        .liquidate(&prices, whale, user, m1, m0, 450_000, 100)
        .unwrap();
    assert_eq!(outcome.repay_amount, 450_000);
    assert_eq!(outcome.seize_shares, 2_699_999_999);
    // 10% of the seizure is retired into reserves.
    let protocol_shares = outcome.seize_shares - outcome.liquidator_shares;
    assert_eq!(protocol_shares, 269_999_999);
    assert_eq!(
        outcome.protocol_reserve_amount,
        bank.markets[m0 as usize].total_reserves.get()
    );

    let m = &bank.markets[m0 as usize];
    assert_eq!(
        m.positions[user as usize].shares.get(),
        5_000_000_000 - outcome.seize_shares
    );
    assert_eq!(
        m.positions[whale as usize].shares.get(),
        outcome.liquidator_shares
    );
    assert_share_conservation(&bank, m0);
}

#[test]
fn test_liquidation_requires_shortfall() {
    let (mut bank, prices, user, whale, m0, m1) = underwater_setup(1_000_000);
    assert_eq!(
        bank.liquidate(&prices, whale, user, m1, m0, 100_000, 100),
        Err(LedgerError::InsufficientShortfall)
    );
}

#[test]
fn test_liquidation_honors_close_factor() {
    let (mut bank, prices, user, whale, m0, m1) = underwater_setup(900_000);
    // 50% close factor caps a 900_000 debt at 450_000 per call.
    assert_eq!(
        bank.liquidate(&prices, whale, user, m1, m0, 450_001, 100),
        Err(LedgerError::TooMuchRepay)
    );
}

#[test]
fn test_liquidation_cannot_overseize() {
    // At $0.40 the incentive-adjusted seizure for a half-close exceeds the
    // borrower's entire collateral.
    let (mut bank, prices, user, whale, m0, m1) = underwater_setup(400_000);
    assert_eq!(
        bank.liquidate(&prices, whale, user, m1, m0, 450_000, 100),
        Err(LedgerError::LiquidateSeizeTooMuch)
    );
}

#[test]
fn test_self_liquidation_rejected() {
    let (mut bank, prices, user, _, m0, m1) = underwater_setup(900_000);
    assert_eq!(
        bank.liquidate(&prices, user, user, m1, m0, 100, 100),
        Err(LedgerError::LiquidateSelf)
    );
}

// ==============================================================================
// SHARE TRANSFER
// ==============================================================================

#[test]
fn test_share_transfer_moves_balance() {
    let mut bank = new_bank();
    let from = register(&mut bank, 1);
    let to = register(&mut bank, 2);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(from, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.transfer_shares(&prices, from, to, market, 2_000_000_000, 100)
        .unwrap();

    let m = &bank.markets[market as usize];
    assert_eq!(m.positions[from as usize].shares.get(), 3_000_000_000);
    assert_eq!(m.positions[to as usize].shares.get(), 2_000_000_000);
    assert_share_conservation(&bank, market);

    assert_eq!(
        bank.transfer_shares(&prices, from, from, market, 1, 100),
        Err(LedgerError::SelfTransfer)
    );
    assert_eq!(
        bank.transfer_shares(&prices, from, to, market, 0, 100),
        Err(LedgerError::InvalidAmount)
    );
}

#[test]
fn test_share_transfer_respects_liquidity() {
    let mut bank = new_bank();
    let whale = register(&mut bank, 1);
    let user = register(&mut bank, 2);
    let to = register(&mut bank, 3);
    let m0 = list_usd_market(&mut bank, 100);
    let m1 = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(whale, m1, 2_000_000, 2_000_000, 100).unwrap();
    bank.mint(user, m0, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, m0).unwrap();
    bank.borrow(&prices, user, m1, 800_000, 100).unwrap();

    // A transfer is a redeem in disguise: same liquidity gate.
    assert_eq!(
        bank.transfer_shares(&prices, user, to, m0, 5_000_000_000, 100),
        Err(LedgerError::InsufficientLiquidity)
    );
}

#[test]
fn test_share_transfer_accrues_interest_first() {
    let mut bank = new_bank();
    let from = register(&mut bank, 1);
    let to = register(&mut bank, 2);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(from, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.borrow(&prices, from, market, 500_000, 100).unwrap();

    // The transfer itself brings the market to the current epoch, so the
    // liquidity veto runs against an up-to-date borrow index.
    bank.transfer_shares(&prices, from, to, market, 1_000_000_000, 1_100)
        .unwrap();
    let m = &bank.markets[market as usize];
    assert_eq!(m.accrual_epoch, 1_100);
    assert!(m.borrow_index.get() > EXP_SCALE);
}

// ==============================================================================
// MEMBERSHIP & LIQUIDITY
// ==============================================================================

#[test]
fn test_enter_market_is_idempotent_and_ordered() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let m0 = list_usd_market(&mut bank, 100);
    let m1 = list_usd_market(&mut bank, 100);
    let m2 = list_usd_market(&mut bank, 100);

    assert!(bank.enter_market(user, m1).unwrap());
    assert!(bank.enter_market(user, m0).unwrap());
    assert!(bank.enter_market(user, m2).unwrap());
    assert!(!bank.enter_market(user, m1).unwrap());
    assert_eq!(bank.controller.entered_markets(user), &[m1, m0, m2]);
}

#[test]
fn test_remove_entered_preserves_order() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let m0 = list_usd_market(&mut bank, 100);
    let m1 = list_usd_market(&mut bank, 100);
    let m2 = list_usd_market(&mut bank, 100);

    bank.enter_market(user, m0).unwrap();
    bank.enter_market(user, m1).unwrap();
    bank.enter_market(user, m2).unwrap();

    assert!(bank.controller.remove_entered(user, m1));
    assert_eq!(bank.controller.entered_markets(user), &[m0, m2]);
    assert!(!bank.controller.remove_entered(user, m1));
}

#[test]
fn test_max_assets_caps_entered_set() {
    let mut bank = new_bank();
    bank.controller.set_max_assets(ADMIN, 2).unwrap();
    let user = register(&mut bank, 1);
    let m0 = list_usd_market(&mut bank, 100);
    let m1 = list_usd_market(&mut bank, 100);
    let m2 = list_usd_market(&mut bank, 100);

    bank.enter_market(user, m0).unwrap();
    bank.enter_market(user, m1).unwrap();
    assert_eq!(
        bank.enter_market(user, m2),
        Err(LedgerError::TooManyAssets)
    );

    // The borrow auto-enter path hits the same cap before touching cash.
    let prices = FixedPrices::one_dollar();
    bank.mint(user, m2, 1_000_000, 1_000_000, 100).unwrap();
    assert_eq!(
        bank.borrow(&prices, user, m2, 1, 100),
        Err(LedgerError::TooManyAssets)
    );
}

#[test]
fn test_exit_market_requires_zero_debt() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.borrow(&prices, user, market, 100_000, 100).unwrap();

    assert_eq!(
        bank.exit_market(&prices, user, market, 100),
        Err(LedgerError::NonzeroBorrowBalance)
    );

    bank.repay(user, market, 100_000, 100).unwrap();
    bank.exit_market(&prices, user, market, 100).unwrap();
    assert!(bank.controller.entered_markets(user).is_empty());
}

#[test]
fn test_account_liquidity_weighs_collateral_and_debt() {
    let mut bank = new_bank();
    let whale = register(&mut bank, 1);
    let user = register(&mut bank, 2);
    let m0 = list_usd_market(&mut bank, 100);
    let m1 = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(whale, m1, 2_000_000, 2_000_000, 100).unwrap();
    bank.mint(user, m0, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, m0).unwrap();

    // $1 at 90% collateral factor, USD in 1e18 scale.
    let (liquidity, shortfall) = bank.account_liquidity(&prices, user, 100).unwrap();
    assert_eq!(liquidity, 900_000_000_000_000_000);
    assert_eq!(shortfall, 0);

    bank.borrow(&prices, user, m1, 500_000, 100).unwrap();
    let (liquidity, shortfall) = bank.account_liquidity(&prices, user, 100).unwrap();
    assert_eq!(liquidity, 400_000_000_000_000_000);
    assert_eq!(shortfall, 0);
}

#[test]
fn test_liquidity_handles_whale_scale_positions() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    // $1M of a 6-decimal underlying: the weighted-collateral product runs
    // far past 128 bits before dividing back to scale.
    bank.mint(user, market, 1_000_000_000_000, 1_000_000_000_000, 100)
        .unwrap();
    bank.enter_market(user, market).unwrap();

    let (liquidity, shortfall) = bank.account_liquidity(&prices, user, 100).unwrap();
    assert_eq!(liquidity, 900_000 * EXP_SCALE);
    assert_eq!(shortfall, 0);

    bank.borrow(&prices, user, market, 890_000_000_000, 100).unwrap();
    let (liquidity, shortfall) = bank.account_liquidity(&prices, user, 100).unwrap();
    assert_eq!(liquidity, 10_000 * EXP_SCALE);
    assert_eq!(shortfall, 0);
}

#[test]
fn test_hypothetical_borrow_in_unentered_market_counts_as_debt() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let m0 = list_usd_market(&mut bank, 100);
    let m1 = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, m0, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, m0).unwrap();

    // A market the account never entered contributes its hypothetical
    // borrow, never collateral.
    let (liquidity, shortfall) = bank
        .controller
        .hypothetical_liquidity(&bank.markets, &prices, user, m1, 0, 400_000)
        .unwrap();
    assert_eq!(liquidity, 500_000_000_000_000_000);
    assert_eq!(shortfall, 0);

    let (_, shortfall) = bank
        .controller
        .hypothetical_liquidity(&bank.markets, &prices, user, m1, 0, 1_000_000)
        .unwrap();
    assert_eq!(shortfall, 100_000_000_000_000_000);
}

#[test]
fn test_liquidity_fails_closed_on_missing_price() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let mut prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();

    prices.set(market, None);
    assert_eq!(
        bank.account_liquidity(&prices, user, 100),
        Err(LedgerError::PriceUnavailable)
    );
}

// ==============================================================================
// REGISTRY & MARKET LIFECYCLE
// ==============================================================================

#[test]
fn test_unregistered_indices_are_rejected() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();
    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();

    // An index straight off the wire must bounce as a typed error no
    // matter how far out of range it is.
    let bogus = u16::MAX;
    assert_eq!(
        bank.transfer_shares(&prices, user, bogus, market, 1_000, 100),
        Err(LedgerError::AccountNotRegistered)
    );
    assert_eq!(
        bank.repay(bogus, market, 1_000, 100),
        Err(LedgerError::AccountNotRegistered)
    );
    assert_eq!(
        bank.liquidate(&prices, user, bogus, market, market, 1_000, 100),
        Err(LedgerError::AccountNotRegistered)
    );
    assert_eq!(
        bank.enter_market(bogus, market),
        Err(LedgerError::AccountNotRegistered)
    );
    assert_eq!(
        bank.account_liquidity(&prices, bogus, 100),
        Err(LedgerError::AccountNotRegistered)
    );
    // The next slot past the registry is just as unregistered as u16::MAX.
    assert_eq!(
        bank.repay(bank.num_accounts, market, 1_000, 100),
        Err(LedgerError::AccountNotRegistered)
    );
}

#[test]
fn test_register_account_is_idempotent() {
    let mut bank = new_bank();
    let a = bank.register_account([1; 32]).unwrap();
    let b = bank.register_account([2; 32]).unwrap();
    assert_eq!((a, b), (0, 1));
    assert_eq!(bank.register_account([1; 32]).unwrap(), 0);
    assert_eq!(bank.find_account(&[2; 32]), Some(1));
    assert_eq!(bank.account_owner(1), Some(&[2; 32]));
    assert_eq!(bank.account_owner(2), None);
}

#[test]
fn test_account_slots_are_finite() {
    let mut bank = new_bank();
    for i in 0..MAX_ACCOUNTS {
        let mut owner = [0u8; 32];
        owner[..8].copy_from_slice(&(i as u64 + 1).to_le_bytes());
        bank.register_account(owner).unwrap();
    }
    assert_eq!(
        bank.register_account([0xFF; 32]),
        Err(LedgerError::AccountLimitExceeded)
    );
}

#[test]
fn test_market_slots_are_finite() {
    let mut bank = new_bank();
    for _ in 0..MAX_MARKETS {
        list_usd_market(&mut bank, 100);
    }
    assert_eq!(
        bank.create_market(
            6,
            RESERVE_FACTOR,
            BASE_RATE,
            0,
            COLLATERAL_FACTOR,
            0,
            CREATION_FEE,
            100
        ),
        Err(LedgerError::MarketLimitExceeded)
    );
}

#[test]
fn test_create_market_validates_inputs() {
    let mut bank = new_bank();
    // Wrong creation bond.
    assert_eq!(
        bank.create_market(
            6,
            RESERVE_FACTOR,
            BASE_RATE,
            0,
            COLLATERAL_FACTOR,
            0,
            CREATION_FEE - 1,
            100
        ),
        Err(LedgerError::InvalidAmount)
    );
    // 19-decimal underlyings would overflow the rate normalization.
    assert_eq!(
        bank.create_market(
            19,
            RESERVE_FACTOR,
            BASE_RATE,
            0,
            COLLATERAL_FACTOR,
            0,
            CREATION_FEE,
            100
        ),
        Err(LedgerError::InvalidAmount)
    );
    // Collateral factor above the 90% hard cap.
    assert_eq!(
        bank.create_market(
            6,
            RESERVE_FACTOR,
            BASE_RATE,
            0,
            COLLATERAL_FACTOR + 1,
            0,
            CREATION_FEE,
            100
        ),
        Err(LedgerError::InvalidAmount)
    );
}

#[test]
fn test_unlisted_market_rejected_everywhere() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let prices = FixedPrices::one_dollar();

    assert_eq!(
        bank.mint(user, 3, 1_000, 1_000, 100),
        Err(LedgerError::MarketNotListed)
    );
    assert_eq!(
        bank.borrow(&prices, user, 3, 1_000, 100),
        Err(LedgerError::MarketNotListed)
    );
    assert_eq!(bank.enter_market(user, 3), Err(LedgerError::MarketNotListed));
}

// ==============================================================================
// RESERVES & ADMIN
// ==============================================================================

#[test]
fn test_reserve_donation_and_withdrawal() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    assert_eq!(bank.add_reserves(market, 10_000, 100).unwrap(), 10_000);

    assert_eq!(
        bank.reduce_reserves([0; 32], market, 5_000, 100),
        Err(LedgerError::Unauthorized)
    );
    assert_eq!(bank.reduce_reserves(ADMIN, market, 5_000, 100).unwrap(), 5_000);
    assert_eq!(
        bank.reduce_reserves(ADMIN, market, 5_001, 100),
        Err(LedgerError::InvalidAmount)
    );

    let m = &bank.markets[market as usize];
    assert_eq!(m.total_reserves.get(), 5_000);
    assert_eq!(m.cash.get(), 1_005_000);
}

#[test]
fn test_admin_setter_bounds() {
    let mut bank = new_bank();
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();
    let c = &mut bank.controller;

    assert_eq!(
        c.set_close_factor([0; 32], EXP_SCALE / 2),
        Err(LedgerError::Unauthorized)
    );
    assert_eq!(
        c.set_close_factor(ADMIN, 40_000_000_000_000_000), // 4% < 5% floor
        Err(LedgerError::InvalidAmount)
    );
    c.set_close_factor(ADMIN, EXP_SCALE / 2).unwrap();

    assert_eq!(
        c.set_liquidation_incentive(ADMIN, EXP_SCALE - 1), // below 1.0
        Err(LedgerError::InvalidAmount)
    );
    assert_eq!(
        c.set_liquidation_incentive(ADMIN, 1_600_000_000_000_000_000), // above 1.5
        Err(LedgerError::InvalidAmount)
    );
    c.set_liquidation_incentive(ADMIN, 1_100_000_000_000_000_000)
        .unwrap();

    assert_eq!(
        c.set_collateral_factor(ADMIN, &prices, market, 900_000_000_000_000_001),
        Err(LedgerError::InvalidAmount)
    );
    c.set_collateral_factor(ADMIN, &prices, market, EXP_SCALE / 2)
        .unwrap();

    assert_eq!(
        c.set_max_assets(ADMIN, MAX_ENTERED as u16 + 1),
        Err(LedgerError::InvalidAmount)
    );
    c.set_max_assets(ADMIN, 4).unwrap();
}

#[test]
fn test_collateral_factor_requires_price() {
    let mut bank = new_bank();
    let market = list_usd_market(&mut bank, 100);
    let mut prices = FixedPrices::one_dollar();
    prices.set(market, None);

    // Worthless collateral must not gain borrowing power.
    assert_eq!(
        bank.controller
            .set_collateral_factor(ADMIN, &prices, market, EXP_SCALE / 2),
        Err(LedgerError::PriceUnavailable)
    );
    // Zeroing the factor needs no price.
    bank.controller
        .set_collateral_factor(ADMIN, &prices, market, 0)
        .unwrap();
}

#[test]
fn test_delisting_freezes_new_activity() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);

    bank.controller
        .set_market_listed(ADMIN, market, false)
        .unwrap();
    assert_eq!(
        bank.mint(user, market, 1_000, 1_000, 100),
        Err(LedgerError::MarketNotListed)
    );

    bank.controller
        .set_market_listed(ADMIN, market, true)
        .unwrap();
    bank.mint(user, market, 1_000, 1_000, 100).unwrap();
}

#[test]
fn test_set_rate_params_accrues_under_old_model_first() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.borrow(&prices, user, market, 500_000, 100).unwrap();

    bank.set_rate_params(ADMIN, market, 2 * BASE_RATE, 0, 1100)
        .unwrap();
    // The 100..1100 window accrued at the old 1e12 rate: 500 of interest.
    assert_eq!(bank.markets[market as usize].total_borrows.get(), 500_500);
    assert_eq!(bank.markets[market as usize].base_rate.get(), 2 * BASE_RATE);
}

// ==============================================================================
// MODERATION STATE MACHINE
// ==============================================================================

#[test]
fn test_flag_validates_window_deposit_and_state() {
    let mut bank = new_bank();
    let market = list_usd_market(&mut bank, 100);
    let flagger = [5u8; 32];

    assert_eq!(
        bank.flag_market(flagger, market, PAUSE_DEPOSIT - 1, 150),
        Err(LedgerError::InvalidAmount)
    );
    assert_eq!(
        bank.flag_market(flagger, market, PAUSE_DEPOSIT, 200),
        Err(LedgerError::ModerationWindowClosed)
    );

    assert_eq!(
        bank.flag_market(flagger, market, PAUSE_DEPOSIT, 150).unwrap(),
        PAUSE_DEPOSIT
    );
    assert!(bank.controller.is_borrow_paused(market));
    assert_eq!(
        bank.controller.moderation[market as usize].state,
        ModerationState::Paused
    );
    assert_eq!(
        bank.flag_market([6; 32], market, PAUSE_DEPOSIT, 160),
        Err(LedgerError::InvalidModerationState)
    );
}

#[test]
fn test_flag_pauses_borrowing() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.flag_market([5; 32], market, PAUSE_DEPOSIT, 150).unwrap();

    assert_eq!(
        bank.borrow(&prices, user, market, 1_000, 150),
        Err(LedgerError::BorrowPaused)
    );
    // Repay and redeem stay open during the pause.
    bank.redeem_shares(&prices, user, market, 1_000_000, 150)
        .unwrap();
}

#[test]
fn test_guardian_reject_reopens_borrowing() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.flag_market([5; 32], market, PAUSE_DEPOSIT, 150).unwrap();

    assert_eq!(
        bank.guardian_reject([5; 32], market, 160),
        Err(LedgerError::Unauthorized)
    );
    assert_eq!(
        bank.guardian_reject(GUARDIAN, market, 200),
        Err(LedgerError::ModerationWindowClosed)
    );

    // Window still open at 199.
    bank.guardian_reject(GUARDIAN, market, 199).unwrap();
    assert!(!bank.controller.is_borrow_paused(market));
    bank.borrow(&prices, user, market, 1_000, 199).unwrap();

    assert_eq!(
        bank.guardian_reject(GUARDIAN, market, 199),
        Err(LedgerError::InvalidModerationState)
    );
}

#[test]
fn test_claim_pays_flagger_and_freezes_market() {
    let mut bank = new_bank();
    let user = register(&mut bank, 1);
    let market = list_usd_market(&mut bank, 100);
    let prices = FixedPrices::one_dollar();
    let flagger = [5u8; 32];

    bank.mint(user, market, 1_000_000, 1_000_000, 100).unwrap();
    bank.enter_market(user, market).unwrap();
    bank.flag_market(flagger, market, PAUSE_DEPOSIT, 150).unwrap();
    assert_eq!(
        bank.controller.total_frozen.get(),
        CREATION_FEE + PAUSE_DEPOSIT
    );

    assert_eq!(
        bank.claim_moderation_reward(flagger, market, 200),
        Err(LedgerError::ModerationWindowActive)
    );
    assert_eq!(
        bank.claim_moderation_reward([6; 32], market, 201),
        Err(LedgerError::Unauthorized)
    );

    // Unchallenged flag: bond plus deposit go to the flagger, once.
    let reward = bank.claim_moderation_reward(flagger, market, 201).unwrap();
    assert_eq!(reward, CREATION_FEE + PAUSE_DEPOSIT);
    assert_eq!(bank.controller.total_frozen.get(), 0);
    assert_eq!(
        bank.claim_moderation_reward(flagger, market, 202),
        Err(LedgerError::AlreadyClaimed)
    );

    // A confirmed market never borrows again.
    assert!(bank.controller.is_borrow_paused(market));
    assert_eq!(
        bank.borrow(&prices, user, market, 1_000, 300),
        Err(LedgerError::BorrowPaused)
    );
}

#[test]
fn test_harvest_settles_undisputed_bond() {
    let mut bank = new_bank();
    let market = list_usd_market(&mut bank, 100);

    assert_eq!(
        bank.harvest_unused_reward(market, 200),
        Err(LedgerError::ModerationWindowActive)
    );

    let swept = bank.harvest_unused_reward(market, 201).unwrap();
    assert_eq!(swept, CREATION_FEE);
    assert_eq!(bank.controller.total_frozen.get(), 0);
    assert_eq!(bank.controller.pending_sweep.get(), CREATION_FEE);
    assert_eq!(bank.controller.take_pending_sweep(), CREATION_FEE);
    assert_eq!(bank.controller.take_pending_sweep(), 0);

    assert_eq!(
        bank.harvest_unused_reward(market, 202),
        Err(LedgerError::InvalidModerationState)
    );
}

#[test]
fn test_harvest_after_rejection_sweeps_deposit_too() {
    let mut bank = new_bank();
    let market = list_usd_market(&mut bank, 100);

    bank.flag_market([5; 32], market, PAUSE_DEPOSIT, 150).unwrap();
    bank.guardian_reject(GUARDIAN, market, 160).unwrap();

    // The overruled flagger forfeits the deposit into the sweep.
    let swept = bank.harvest_unused_reward(market, 201).unwrap();
    assert_eq!(swept, CREATION_FEE + PAUSE_DEPOSIT);
    assert_eq!(bank.controller.pending_sweep.get(), swept);
    assert_eq!(bank.controller.total_frozen.get(), 0);
}

// ==============================================================================
// ERROR CODES
// ==============================================================================

#[test]
fn test_error_codes_are_stable() {
    assert_eq!(LedgerError::Unauthorized.code(), 1);
    assert_eq!(LedgerError::InsufficientLiquidity.code(), 4);
    assert_eq!(LedgerError::InvalidAmount.code(), 19);
    assert_eq!(LedgerError::MarketLimitExceeded.code(), 25);
    assert_eq!(LedgerError::AccountNotRegistered.code(), 26);
    assert_eq!(LedgerError::Math(MathSub::RateCalculation).code(), 100);
    assert_eq!(LedgerError::Math(MathSub::MintShares).code(), 108);
    assert_eq!(LedgerError::Math(MathSub::CashDelta).code(), 113);
}

// ==============================================================================
// DETERMINISTIC FUZZ
// ==============================================================================

/// Random mint/redeem/borrow/repay traffic on a zero-interest market; after
/// every accepted operation the ledger must balance exactly.
#[test]
fn test_fuzz_ledger_stays_balanced() {
    let params = default_params();
    let mut bank = Box::new(Bank::new(params));
    let market = bank
        .create_market(6, 0, 0, 0, EXP_SCALE / 2, 0, CREATION_FEE, 0)
        .unwrap();
    let prices = FixedPrices::one_dollar();

    let users: [u16; 4] = core::array::from_fn(|i| {
        bank.register_account([i as u8 + 1; 32]).unwrap()
    });
    for &u in &users {
        bank.enter_market(u, market).unwrap();
    }

    let mut rng = Rng::new(0x5eed_1e9d);
    let mut expected_cash: u128 = 0;

    for _ in 0..5_000 {
        let user = users[rng.u64(0, 3) as usize];
        let amount = rng.u128(1, 1_000_000);
        match rng.u64(0, 3) {
            0 => {
                if bank.mint(user, market, amount, amount, 0).is_ok() {
                    expected_cash += amount;
                }
            }
            1 => {
                let shares = rng.u128(1, 6_000_000_000);
                if let Ok(out) = bank.redeem_shares(&prices, user, market, shares, 0) {
                    expected_cash -= out.redeem_amount;
                }
            }
            2 => {
                if bank.borrow(&prices, user, market, amount, 0).is_ok() {
                    expected_cash -= amount;
                }
            }
            _ => {
                if bank.repay(user, market, amount, 0).is_ok() {
                    expected_cash += amount;
                }
            }
        }

        let m = &bank.markets[market as usize];
        assert_eq!(m.cash.get(), expected_cash);
        assert_share_conservation(&bank, market);

        // With a zero rate the index never moves, so per-account balances
        // must sum to the total exactly.
        let owed: u128 = users
            .iter()
            .map(|&u| m.borrow_balance_stored(u).unwrap())
            .sum();
        assert_eq!(owed, m.total_borrows.get());
    }
}
