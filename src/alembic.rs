//! Alembic: Single-file Solana program with embedded pooled-lending Bank.

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

#[cfg(not(feature = "no-entrypoint"))]
solana_security_txt::security_txt! {
    name: "Alembic",
    project_url: "https://github.com/alembic-labs/alembic",
    contacts: "email:security@alembic-labs.xyz",
    policy: "https://github.com/alembic-labs/alembic/blob/master/SECURITY.md"
}

// 1. mod constants
pub mod constants {
    use crate::state::{MarketConfig, SlabHeader};
    use alembic::{Bank, MAX_MARKETS};
    use core::mem::{align_of, size_of};

    pub const MAGIC: u64 = 0x414c454d42494331; // "ALEMBIC1"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = size_of::<SlabHeader>();
    pub const CONFIG_LEN: usize = size_of::<MarketConfig>();
    pub const CONFIGS_LEN: usize = CONFIG_LEN * MAX_MARKETS;
    pub const BANK_ALIGN: usize = align_of::<Bank>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const BANK_OFF: usize = align_up(HEADER_LEN + CONFIGS_LEN, BANK_ALIGN);
    pub const BANK_LEN: usize = size_of::<Bank>();
    pub const SLAB_LEN: usize = BANK_OFF + BANK_LEN;

    /// Full repay sentinel: transfer exactly the accrued debt.
    pub const REPAY_MAX: u64 = u64::MAX;
}

// 2. mod zc (Zero-Copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use crate::constants::{BANK_ALIGN, BANK_LEN, BANK_OFF};
    use alembic::Bank;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn bank_ref<'a>(data: &'a [u8]) -> Result<&'a Bank, ProgramError> {
        if data.len() < BANK_OFF + BANK_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(BANK_OFF) };
        if (ptr as usize) % BANK_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const Bank) })
    }

    #[inline]
    pub fn bank_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut Bank, ProgramError> {
        if data.len() < BANK_OFF + BANK_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(BANK_OFF) };
        if (ptr as usize) % BANK_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut Bank) })
    }
}

// 3. mod error
pub mod error {
    use alembic::LedgerError;
    use num_derive::FromPrimitive;
    use solana_program::program_error::ProgramError;

    /// Wrapper-level failures. Codes start at 1000; ledger errors keep their
    /// own 1..=125 range so logs distinguish plumbing from protocol math.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
    pub enum AlembicError {
        InvalidMagic = 1000,
        InvalidVersion = 1001,
        AlreadyInitialized = 1002,
        NotInitialized = 1003,
        InvalidSlabLen = 1004,
        InvalidOracleKey = 1005,
        OracleStale = 1006,
        OracleConfTooWide = 1007,
        OracleInvalid = 1008,
        InvalidVaultAta = 1009,
        InvalidMint = 1010,
        ExpectedSigner = 1011,
        ExpectedWritable = 1012,
        AccountNotRegistered = 1013,
        AmountOverflow = 1014,
        InvalidFeeSink = 1015,
    }

    impl From<AlembicError> for ProgramError {
        fn from(e: AlembicError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    pub fn map_ledger_error(e: LedgerError) -> ProgramError {
        ProgramError::Custom(e.code())
    }
}

// 4. mod ix
pub mod ix {
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    /// Global risk configuration carried by InitSlab.
    #[derive(Debug, Clone, Copy)]
    pub struct InitParams {
        pub fee_sink: Pubkey,
        pub pause_guardian: Pubkey,
        pub close_factor: u128,
        pub liquidation_incentive: u128,
        pub protocol_seize_share: u128,
        pub user_pause_deposit: u128,
        pub pool_creation_fee: u128,
        pub guardian_moderate_time: u64,
        pub max_assets: u16,
    }

    #[derive(Debug)]
    pub enum Instruction {
        InitSlab {
            params: InitParams,
        },
        CreateMarket {
            oracle: Pubkey,
            max_staleness_slots: u64,
            conf_filter_bps: u16,
            reserve_factor: u128,
            base_rate: u128,
            multiplier: u128,
            collateral_factor: u128,
            borrow_delay: u64,
        },
        RegisterAccount,
        Mint { market: u16, amount: u64 },
        RedeemShares { market: u16, shares: u64 },
        RedeemUnderlying { market: u16, amount: u64 },
        Borrow { market: u16, amount: u64 },
        Repay { market: u16, amount: u64 },
        RepayOnBehalf { market: u16, borrower: u16, amount: u64 },
        Liquidate {
            borrower: u16,
            debt_market: u16,
            collateral_market: u16,
            repay_amount: u64,
        },
        TransferShares { market: u16, to: u16, shares: u64 },
        EnterMarket { market: u16 },
        ExitMarket { market: u16 },
        AccrueInterest { market: u16 },
        AddReserves { market: u16, amount: u64 },
        ReduceReserves { market: u16, amount: u64 },
        SetReserveFactor { market: u16, mantissa: u128 },
        SetRateParams { market: u16, base_rate: u128, multiplier: u128 },
        SetCloseFactor { mantissa: u128 },
        SetLiquidationIncentive { mantissa: u128 },
        SetCollateralFactor { market: u16, mantissa: u128 },
        SetMaxAssets { max_assets: u16 },
        SetPauseGuardian { guardian: Pubkey },
        FlagMarket { market: u16 },
        GuardianReject { market: u16 },
        HarvestUnusedReward { market: u16 },
        ClaimModerationReward { market: u16 },
        SweepModerationFees,
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => {
                    let fee_sink = read_pubkey(&mut rest)?;
                    let pause_guardian = read_pubkey(&mut rest)?;
                    let close_factor = read_u128(&mut rest)?;
                    let liquidation_incentive = read_u128(&mut rest)?;
                    let protocol_seize_share = read_u128(&mut rest)?;
                    let user_pause_deposit = read_u128(&mut rest)?;
                    let pool_creation_fee = read_u128(&mut rest)?;
                    let guardian_moderate_time = read_u64(&mut rest)?;
                    let max_assets = read_u16(&mut rest)?;
                    Ok(Instruction::InitSlab {
                        params: InitParams {
                            fee_sink,
                            pause_guardian,
                            close_factor,
                            liquidation_incentive,
                            protocol_seize_share,
                            user_pause_deposit,
                            pool_creation_fee,
                            guardian_moderate_time,
                            max_assets,
                        },
                    })
                }
                1 => {
                    let oracle = read_pubkey(&mut rest)?;
                    let max_staleness_slots = read_u64(&mut rest)?;
                    let conf_filter_bps = read_u16(&mut rest)?;
                    let reserve_factor = read_u128(&mut rest)?;
                    let base_rate = read_u128(&mut rest)?;
                    let multiplier = read_u128(&mut rest)?;
                    let collateral_factor = read_u128(&mut rest)?;
                    let borrow_delay = read_u64(&mut rest)?;
                    Ok(Instruction::CreateMarket {
                        oracle,
                        max_staleness_slots,
                        conf_filter_bps,
                        reserve_factor,
                        base_rate,
                        multiplier,
                        collateral_factor,
                        borrow_delay,
                    })
                }
                2 => Ok(Instruction::RegisterAccount),
                3 => {
                    let market = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Mint { market, amount })
                }
                4 => {
                    let market = read_u16(&mut rest)?;
                    let shares = read_u64(&mut rest)?;
                    Ok(Instruction::RedeemShares { market, shares })
                }
                5 => {
                    let market = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::RedeemUnderlying { market, amount })
                }
                6 => {
                    let market = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Borrow { market, amount })
                }
                7 => {
                    let market = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Repay { market, amount })
                }
                8 => {
                    let market = read_u16(&mut rest)?;
                    let borrower = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::RepayOnBehalf { market, borrower, amount })
                }
                9 => {
                    let borrower = read_u16(&mut rest)?;
                    let debt_market = read_u16(&mut rest)?;
                    let collateral_market = read_u16(&mut rest)?;
                    let repay_amount = read_u64(&mut rest)?;
                    Ok(Instruction::Liquidate {
                        borrower,
                        debt_market,
                        collateral_market,
                        repay_amount,
                    })
                }
                10 => {
                    let market = read_u16(&mut rest)?;
                    let to = read_u16(&mut rest)?;
                    let shares = read_u64(&mut rest)?;
                    Ok(Instruction::TransferShares { market, to, shares })
                }
                11 => {
                    let market = read_u16(&mut rest)?;
                    Ok(Instruction::EnterMarket { market })
                }
                12 => {
                    let market = read_u16(&mut rest)?;
                    Ok(Instruction::ExitMarket { market })
                }
                13 => {
                    let market = read_u16(&mut rest)?;
                    Ok(Instruction::AccrueInterest { market })
                }
                14 => {
                    let market = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::AddReserves { market, amount })
                }
                15 => {
                    let market = read_u16(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::ReduceReserves { market, amount })
                }
                16 => {
                    let market = read_u16(&mut rest)?;
                    let mantissa = read_u128(&mut rest)?;
                    Ok(Instruction::SetReserveFactor { market, mantissa })
                }
                17 => {
                    let market = read_u16(&mut rest)?;
                    let base_rate = read_u128(&mut rest)?;
                    let multiplier = read_u128(&mut rest)?;
                    Ok(Instruction::SetRateParams { market, base_rate, multiplier })
                }
                18 => {
                    let mantissa = read_u128(&mut rest)?;
                    Ok(Instruction::SetCloseFactor { mantissa })
                }
                19 => {
                    let mantissa = read_u128(&mut rest)?;
                    Ok(Instruction::SetLiquidationIncentive { mantissa })
                }
                20 => {
                    let market = read_u16(&mut rest)?;
                    let mantissa = read_u128(&mut rest)?;
                    Ok(Instruction::SetCollateralFactor { market, mantissa })
                }
                21 => {
                    let max_assets = read_u16(&mut rest)?;
                    Ok(Instruction::SetMaxAssets { max_assets })
                }
                22 => {
                    let guardian = read_pubkey(&mut rest)?;
                    Ok(Instruction::SetPauseGuardian { guardian })
                }
                23 => {
                    let market = read_u16(&mut rest)?;
                    Ok(Instruction::FlagMarket { market })
                }
                24 => {
                    let market = read_u16(&mut rest)?;
                    Ok(Instruction::GuardianReject { market })
                }
                25 => {
                    let market = read_u16(&mut rest)?;
                    Ok(Instruction::HarvestUnusedReward { market })
                }
                26 => {
                    let market = read_u16(&mut rest)?;
                    Ok(Instruction::ClaimModerationReward { market })
                }
                27 => Ok(Instruction::SweepModerationFees),
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        if input.len() < 2 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(2);
        *input = rest;
        Ok(u16::from_le_bytes(*arrayref::array_ref![bytes, 0, 2]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(*arrayref::array_ref![bytes, 0, 8]))
    }

    fn read_u128(input: &mut &[u8]) -> Result<u128, ProgramError> {
        if input.len() < 16 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(16);
        *input = rest;
        Ok(u128::from_le_bytes(*arrayref::array_ref![bytes, 0, 16]))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(Pubkey::new_from_array(*arrayref::array_ref![bytes, 0, 32]))
    }
}

// 5. mod accounts
pub mod accounts {
    use crate::error::AlembicError;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(AlembicError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(AlembicError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], program_id)
    }
}

// 6. mod state
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN};
    use alembic::MAX_MARKETS;
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        /// Destination for swept moderation bonds and reserve withdrawals.
        pub fee_sink: [u8; 32],
        pub _reserved: [u8; 16],
    }

    /// Per-market wrapper config: the token plumbing the ledger never sees.
    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct MarketConfig {
        pub underlying_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        pub oracle: [u8; 32],
        pub max_staleness_slots: u64,
        pub conf_filter_bps: u16,
        pub vault_authority_bump: u8,
        pub underlying_decimals: u8,
        pub _padding: [u8; 4],
    }

    pub fn slab_data_mut<'a, 'b>(
        ai: &'b AccountInfo<'a>,
    ) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8], market: u16) -> MarketConfig {
        let off = HEADER_LEN + market as usize * CONFIG_LEN;
        let mut c = MarketConfig::zeroed();
        let src = &data[off..off + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], market: u16, c: &MarketConfig) {
        let off = HEADER_LEN + market as usize * CONFIG_LEN;
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[off..off + CONFIG_LEN];
        dst.copy_from_slice(src);
    }

    /// Copy of every market's config, so the slab borrow can be handed to
    /// the zero-copy Bank accessor afterwards.
    pub fn read_all_configs(data: &[u8]) -> [MarketConfig; MAX_MARKETS] {
        let mut out = [MarketConfig::zeroed(); MAX_MARKETS];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = read_config(data, i as u16);
        }
        out
    }
}

// 7. mod oracle
pub mod oracle {
    use crate::error::AlembicError;
    use crate::state::MarketConfig;
    use alembic::PriceSource;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    /// Raw parse of a Pyth price account: USD per whole token, 1e6 scale.
    /// Fails closed on non-positive price, staleness, or a confidence band
    /// wider than the configured bps filter.
    pub fn read_pyth_price_e6(
        price_ai: &AccountInfo,
        now_slot: u64,
        max_staleness: u64,
        conf_bps: u16,
    ) -> Result<u64, ProgramError> {
        let data = price_ai.try_borrow_data()?;
        if data.len() < 208 {
            return Err(ProgramError::InvalidAccountData);
        }

        let expo = i32::from_le_bytes(*arrayref::array_ref![data, 20, 4]);
        let price = i64::from_le_bytes(*arrayref::array_ref![data, 176, 8]);
        let conf = u64::from_le_bytes(*arrayref::array_ref![data, 184, 8]);
        let pub_slot = u64::from_le_bytes(*arrayref::array_ref![data, 200, 8]);

        if price <= 0 {
            return Err(AlembicError::OracleInvalid.into());
        }

        let age = now_slot.saturating_sub(pub_slot);
        if age > max_staleness {
            return Err(AlembicError::OracleStale.into());
        }

        let price_u = price as u128;
        let lhs = (conf as u128) * 10_000;
        let rhs = price_u * (conf_bps as u128);
        if lhs > rhs {
            return Err(AlembicError::OracleConfTooWide.into());
        }

        let scale = expo + 6;
        let final_price_u128 = if scale >= 0 {
            let mul = 10u128.pow(scale as u32);
            price_u.checked_mul(mul).ok_or(AlembicError::AmountOverflow)?
        } else {
            let div = 10u128.pow((-scale) as u32);
            price_u / div
        };

        if final_price_u128 == 0 {
            return Err(AlembicError::OracleInvalid.into());
        }
        if final_price_u128 > u64::MAX as u128 {
            return Err(AlembicError::AmountOverflow.into());
        }

        Ok(final_price_u128 as u64)
    }

    /// Ledger price mantissa: scaled by 10^(30 - decimals) so that
    /// `price * smallest_units / 1e18` lands in USD-1e18, the unit the
    /// controller's liquidity sums accumulate in.
    pub fn price_mantissa_scaled(price_e6: u64, decimals: u8) -> Option<u128> {
        if decimals > 18 {
            return None;
        }
        (price_e6 as u128).checked_mul(10u128.pow(30 - decimals as u32))
    }

    /// PriceSource over the oracle accounts a transaction carried. A market
    /// whose oracle account is missing, stale, or wide simply has no price;
    /// the ledger turns that into PRICE_UNAVAILABLE.
    pub struct OraclePrices<'a, 'info> {
        pub configs: &'a [MarketConfig],
        pub oracles: &'a [AccountInfo<'info>],
        pub now_slot: u64,
    }

    impl<'a, 'info> PriceSource for OraclePrices<'a, 'info> {
        fn price_mantissa(&self, market: u16) -> Option<u128> {
            let cfg = self.configs.get(market as usize)?;
            if cfg.oracle == [0u8; 32] {
                return None;
            }
            let key = Pubkey::new_from_array(cfg.oracle);
            let ai = self.oracles.iter().find(|a| *a.key == key)?;
            let e6 = read_pyth_price_e6(
                ai,
                self.now_slot,
                cfg.max_staleness_slots,
                cfg.conf_filter_bps,
            )
            .ok()?;
            price_mantissa_scaled(e6, cfg.underlying_decimals)
        }
    }
}

// 8. mod vault (SPL token flows; simulated in unit tests)
pub mod vault {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::Account as TokenAccount;

    pub fn deposit<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(
                &ix,
                &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()],
            )
        }
        #[cfg(test)]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    pub fn withdraw<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()],
                _signer_seeds,
            )
        }
        #[cfg(test)]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }
}

// 9. mod bond (lamport bonds for creation fees and pause deposits)
pub mod bond {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::{program::invoke, system_instruction};

    /// Move `amount` lamports from the payer into the slab's balance.
    pub fn collect<'a>(
        payer: &AccountInfo<'a>,
        slab: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        if amount == 0 {
            return Ok(());
        }
        #[cfg(not(test))]
        {
            let ix = system_instruction::transfer(payer.key, slab.key, amount);
            invoke(&ix, &[payer.clone(), slab.clone()])
        }
        #[cfg(test)]
        {
            let mut from = payer.try_borrow_mut_lamports()?;
            **from = from
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            let mut to = slab.try_borrow_mut_lamports()?;
            **to = to
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            Ok(())
        }
    }

    /// Pay out of the slab's balance. Direct lamport moves are legal in both
    /// runtimes because the slab is program-owned.
    pub fn payout<'a>(
        slab: &AccountInfo<'a>,
        recipient: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        if amount == 0 {
            return Ok(());
        }
        let mut from = slab.try_borrow_mut_lamports()?;
        **from = from
            .checked_sub(amount)
            .ok_or(ProgramError::InsufficientFunds)?;
        let mut to = recipient.try_borrow_mut_lamports()?;
        **to = to
            .checked_add(amount)
            .ok_or(ProgramError::InvalidAccountData)?;
        Ok(())
    }
}

// 10. mod events
//
// Off-core audit surface for indexers and reward distribution. Event names
// and field order are a compatibility contract; never reorder or rename.
pub mod events {
    use alloc::format;
    use solana_program::{msg, pubkey::Pubkey};

    pub fn market_listed(market: u16) {
        msg!("MarketListed market={}", market);
    }

    pub fn new_collateral_factor(market: u16, old_mantissa: u128, new_mantissa: u128) {
        msg!(
            "NewCollateralFactor market={} old_mantissa={} new_mantissa={}",
            market,
            old_mantissa,
            new_mantissa
        );
    }

    pub fn market_entered(market: u16, account: &Pubkey) {
        msg!("MarketEntered market={} account={}", market, account);
    }

    pub fn market_exited(market: u16, account: &Pubkey) {
        msg!("MarketExited market={} account={}", market, account);
    }

    pub fn mint(minter: &Pubkey, mint_amount: u128, mint_tokens: u128) {
        msg!(
            "Mint minter={} mint_amount={} mint_tokens={}",
            minter,
            mint_amount,
            mint_tokens
        );
    }

    pub fn redeem(redeemer: &Pubkey, redeem_amount: u128, redeem_tokens: u128) {
        msg!(
            "Redeem redeemer={} redeem_amount={} redeem_tokens={}",
            redeemer,
            redeem_amount,
            redeem_tokens
        );
    }

    pub fn borrow(borrower: &Pubkey, borrow_amount: u128, account_borrows: u128, total_borrows: u128) {
        msg!(
            "Borrow borrower={} borrow_amount={} account_borrows={} total_borrows={}",
            borrower,
            borrow_amount,
            account_borrows,
            total_borrows
        );
    }

    pub fn repay_borrow(
        payer: &Pubkey,
        borrower: u16,
        repay_amount: u128,
        account_borrows: u128,
        total_borrows: u128,
    ) {
        msg!(
            "RepayBorrow payer={} borrower={} repay_amount={} account_borrows={} total_borrows={}",
            payer,
            borrower,
            repay_amount,
            account_borrows,
            total_borrows
        );
    }

    pub fn liquidate_borrow(
        liquidator: &Pubkey,
        borrower: u16,
        repay_amount: u128,
        collateral_market: u16,
        seize_tokens: u128,
    ) {
        msg!(
            "LiquidateBorrow liquidator={} borrower={} repay_amount={} collateral_market={} seize_tokens={}",
            liquidator,
            borrower,
            repay_amount,
            collateral_market,
            seize_tokens
        );
    }

    pub fn transfer(from: &Pubkey, to: u16, amount: u128) {
        msg!("Transfer from={} to={} amount={}", from, to, amount);
    }

    pub fn accrue_interest(
        cash_prior: u128,
        interest_accumulated: u128,
        borrow_index: u128,
        total_borrows: u128,
    ) {
        msg!(
            "AccrueInterest cash_prior={} interest_accumulated={} borrow_index={} total_borrows={}",
            cash_prior,
            interest_accumulated,
            borrow_index,
            total_borrows
        );
    }

    pub fn pool_paused(market: u16, flagger: &Pubkey, deposit: u64) {
        msg!(
            "PoolPaused market={} flagger={} deposit={}",
            market,
            flagger,
            deposit
        );
    }

    pub fn pool_unpaused(market: u16) {
        msg!("PoolUnpaused market={}", market);
    }

    pub fn unfreeze_pool_amount(market: u16, amount: u128) {
        msg!("UnfreezePoolAmount market={} amount={}", market, amount);
    }
}

// 11. mod processor
pub mod processor {
    use alloc::format;
    use crate::{
        accounts, bond, events,
        constants::{MAGIC, REPAY_MAX, SLAB_LEN, VERSION},
        error::{map_ledger_error, AlembicError},
        ix::Instruction,
        oracle::OraclePrices,
        state::{self, MarketConfig, SlabHeader},
        vault, zc,
    };
    use alembic::{Bank, LedgerError, MarketView, RiskParams, U128, MAX_MARKETS};
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        msg,
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(AlembicError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(AlembicError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(AlembicError::InvalidVersion.into());
        }
        Ok(())
    }

    fn registered(bank: &Bank, key: &Pubkey) -> Result<u16, ProgramError> {
        bank.find_account(&key.to_bytes())
            .ok_or_else(|| AlembicError::AccountNotRegistered.into())
    }

    /// Wire-supplied market ids are bounded before any config slicing.
    fn check_market(market: u16) -> Result<(), ProgramError> {
        if market as usize >= MAX_MARKETS {
            return Err(map_ledger_error(LedgerError::MarketNotListed));
        }
        Ok(())
    }

    /// Wire-supplied account indices are bounded before any slab indexing.
    fn check_idx(bank: &Bank, idx: u16) -> Result<(), ProgramError> {
        if idx >= bank.num_accounts {
            return Err(AlembicError::AccountNotRegistered.into());
        }
        Ok(())
    }

    fn verify_vault(
        a_vault: &AccountInfo,
        expected_owner: &Pubkey,
        expected_mint: &Pubkey,
        expected_pubkey: &Pubkey,
    ) -> Result<(), ProgramError> {
        if a_vault.key != expected_pubkey {
            return Err(AlembicError::InvalidVaultAta.into());
        }
        if a_vault.owner != &spl_token::ID {
            return Err(AlembicError::InvalidVaultAta.into());
        }
        if a_vault.data_len() != spl_token::state::Account::LEN {
            return Err(AlembicError::InvalidVaultAta.into());
        }

        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(AlembicError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(AlembicError::InvalidVaultAta.into());
        }
        Ok(())
    }

    fn verify_market_vault(
        program_id: &Pubkey,
        slab_key: &Pubkey,
        a_vault: &AccountInfo,
        config: &MarketConfig,
    ) -> Result<(), ProgramError> {
        let (auth, _) = accounts::derive_vault_authority(program_id, slab_key);
        verify_vault(
            a_vault,
            &auth,
            &Pubkey::new_from_array(config.underlying_mint),
            &Pubkey::new_from_array(config.vault_pubkey),
        )
    }

    fn token_amount(ai: &AccountInfo) -> Result<u64, ProgramError> {
        let data = ai.try_borrow_data()?;
        Ok(spl_token::state::Account::unpack(&data)?.amount)
    }

    fn cast_u64(v: u128) -> Result<u64, ProgramError> {
        u64::try_from(v).map_err(|_| AlembicError::AmountOverflow.into())
    }

    fn clock_slot(a_clock: &AccountInfo) -> Result<u64, ProgramError> {
        Ok(Clock::from_account_info(a_clock)?.slot)
    }

    /// Transfer `amount` into the vault and report what actually arrived.
    /// The difference feeds the ledger's fee-on-transfer handling.
    fn deposit_measured<'a>(
        a_token: &AccountInfo<'a>,
        a_source: &AccountInfo<'a>,
        a_vault: &AccountInfo<'a>,
        a_authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<u64, ProgramError> {
        let before = token_amount(a_vault)?;
        vault::deposit(a_token, a_source, a_vault, a_authority, amount)?;
        let after = token_amount(a_vault)?;
        after
            .checked_sub(before)
            .ok_or_else(|| AlembicError::AmountOverflow.into())
    }

    fn withdraw_from_vault<'a>(
        a_token: &AccountInfo<'a>,
        a_vault: &AccountInfo<'a>,
        a_dest: &AccountInfo<'a>,
        a_vault_pda: &AccountInfo<'a>,
        slab_key: &Pubkey,
        bump: u8,
        amount: u64,
    ) -> Result<(), ProgramError> {
        let seed1: &[u8] = b"vault";
        let seed2: &[u8] = slab_key.as_ref();
        let bump_arr: [u8; 1] = [bump];
        let seed3: &[u8] = &bump_arr;
        let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
        let signer_seeds: [&[&[u8]]; 1] = [&seeds];
        vault::withdraw(a_token, a_vault, a_dest, a_vault_pda, amount, &signer_seeds)
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitSlab { params } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(AlembicError::AlreadyInitialized.into());
                }

                let (_, bump) = accounts::derive_vault_authority(program_id, a_slab.key);

                for b in data.iter_mut() {
                    *b = 0;
                }

                let bank = zc::bank_mut(&mut data)?;
                bank.init_in_place(RiskParams {
                    close_factor: U128::new(params.close_factor),
                    liquidation_incentive: U128::new(params.liquidation_incentive),
                    protocol_seize_share: U128::new(params.protocol_seize_share),
                    user_pause_deposit: U128::new(params.user_pause_deposit),
                    pool_creation_fee: U128::new(params.pool_creation_fee),
                    max_assets: params.max_assets,
                    _padding: [0; 6],
                    guardian_moderate_time: params.guardian_moderate_time,
                    admin: a_admin.key.to_bytes(),
                    pause_guardian: params.pause_guardian.to_bytes(),
                });

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: a_admin.key.to_bytes(),
                    fee_sink: params.fee_sink.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            }
            Instruction::CreateMarket {
                oracle: oracle_key,
                max_staleness_slots,
                conf_filter_bps,
                reserve_factor,
                base_rate,
                multiplier,
                collateral_factor,
                borrow_delay,
            } => {
                accounts::expect_len(accounts, 6)?;
                let a_creator = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];
                let a_oracle = &accounts[4];
                let a_clock = &accounts[5];

                accounts::expect_signer(a_creator)?;
                accounts::expect_writable(a_slab)?;
                accounts::expect_key(a_oracle, &oracle_key)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let header = state::read_header(&data);

                accounts::expect_owner(a_mint, &spl_token::ID)?;
                let decimals = {
                    let mint_data = a_mint.try_borrow_data()?;
                    spl_token::state::Mint::unpack(&mint_data)?.decimals
                };

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;

                // One vault per market, never shared.
                let configs = state::read_all_configs(&data);
                if configs.iter().any(|c| c.vault_pubkey == a_vault.key.to_bytes()) {
                    return Err(AlembicError::InvalidVaultAta.into());
                }

                let now = clock_slot(a_clock)?;

                let (market_id, fee) = {
                    let bank = zc::bank_mut(&mut data)?;
                    let fee = cast_u64(bank.controller.params.pool_creation_fee.get())?;
                    let market_id = bank
                        .create_market(
                            decimals as u32,
                            reserve_factor,
                            base_rate,
                            multiplier,
                            collateral_factor,
                            borrow_delay,
                            fee as u128,
                            now,
                        )
                        .map_err(map_ledger_error)?;
                    (market_id, fee)
                };

                bond::collect(a_creator, a_slab, fee)?;

                state::write_config(
                    &mut data,
                    market_id,
                    &MarketConfig {
                        underlying_mint: a_mint.key.to_bytes(),
                        vault_pubkey: a_vault.key.to_bytes(),
                        oracle: oracle_key.to_bytes(),
                        max_staleness_slots,
                        conf_filter_bps,
                        vault_authority_bump: header.bump,
                        underlying_decimals: decimals,
                        _padding: [0; 4],
                    },
                );
                events::market_listed(market_id);
                events::new_collateral_factor(market_id, 0, collateral_factor);
            }
            Instruction::RegisterAccount => {
                accounts::expect_len(accounts, 2)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let bank = zc::bank_mut(&mut data)?;
                let idx = bank
                    .register_account(a_user.key.to_bytes())
                    .map_err(map_ledger_error)?;
                msg!("register_account: idx={}", idx);
            }
            Instruction::Mint { market, amount } => {
                accounts::expect_len(accounts, 6)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_user_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];
                let a_clock = &accounts[5];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                check_market(market)?;
                let config = state::read_config(&data, market);
                verify_market_vault(program_id, a_slab.key, a_vault, &config)?;

                let now = clock_slot(a_clock)?;
                let received = deposit_measured(a_token, a_user_ata, a_vault, a_user, amount)?;

                let bank = zc::bank_mut(&mut data)?;
                let idx = registered(bank, a_user.key)?;
                let outcome = bank
                    .mint(idx, market, amount as u128, received as u128, now)
                    .map_err(map_ledger_error)?;
                events::mint(a_user.key, outcome.mint_amount, outcome.mint_shares);
            }
            Instruction::RedeemShares { market, shares } => {
                process_redeem(program_id, accounts, market, shares, true)?;
            }
            Instruction::RedeemUnderlying { market, amount } => {
                process_redeem(program_id, accounts, market, amount, false)?;
            }
            Instruction::Borrow { market, amount } => {
                accounts::expect_len(accounts, 7)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_user_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                check_market(market)?;
                let configs = state::read_all_configs(&data);
                let config = &configs[market as usize];
                verify_market_vault(program_id, a_slab.key, a_vault, config)?;

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;

                let now = clock_slot(a_clock)?;
                let prices = OraclePrices {
                    configs: &configs,
                    oracles: &accounts[7..],
                    now_slot: now,
                };

                let outcome = {
                    let bank = zc::bank_mut(&mut data)?;
                    let idx = registered(bank, a_user.key)?;
                    bank.borrow(&prices, idx, market, amount as u128, now)
                        .map_err(map_ledger_error)?
                };

                withdraw_from_vault(
                    a_token,
                    a_vault,
                    a_user_ata,
                    a_vault_pda,
                    a_slab.key,
                    config.vault_authority_bump,
                    amount,
                )?;
                events::borrow(
                    a_user.key,
                    outcome.borrow_amount,
                    outcome.account_borrows,
                    outcome.total_borrows,
                );
            }
            Instruction::Repay { market, amount } => {
                process_repay(program_id, accounts, market, None, amount)?;
            }
            Instruction::RepayOnBehalf { market, borrower, amount } => {
                process_repay(program_id, accounts, market, Some(borrower), amount)?;
            }
            Instruction::Liquidate {
                borrower,
                debt_market,
                collateral_market,
                repay_amount,
            } => {
                accounts::expect_len(accounts, 6)?;
                let a_liquidator = &accounts[0];
                let a_slab = &accounts[1];
                let a_liquidator_ata = &accounts[2];
                let a_debt_vault = &accounts[3];
                let a_token = &accounts[4];
                let a_clock = &accounts[5];

                accounts::expect_signer(a_liquidator)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                check_market(debt_market)?;
                check_market(collateral_market)?;
                let configs = state::read_all_configs(&data);
                verify_market_vault(
                    program_id,
                    a_slab.key,
                    a_debt_vault,
                    &configs[debt_market as usize],
                )?;

                let now = clock_slot(a_clock)?;
                let prices = OraclePrices {
                    configs: &configs,
                    oracles: &accounts[6..],
                    now_slot: now,
                };

                let received = deposit_measured(
                    a_token,
                    a_liquidator_ata,
                    a_debt_vault,
                    a_liquidator,
                    repay_amount,
                )?;

                let bank = zc::bank_mut(&mut data)?;
                let liquidator_idx = registered(bank, a_liquidator.key)?;
                let outcome = bank
                    .liquidate(
                        &prices,
                        liquidator_idx,
                        borrower,
                        debt_market,
                        collateral_market,
                        received as u128,
                        now,
                    )
                    .map_err(map_ledger_error)?;
                events::liquidate_borrow(
                    a_liquidator.key,
                    borrower,
                    outcome.repay_amount,
                    collateral_market,
                    outcome.seize_shares,
                );
            }
            Instruction::TransferShares { market, to, shares } => {
                accounts::expect_len(accounts, 3)?;
                let a_from = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_from)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let configs = state::read_all_configs(&data);

                let now = clock_slot(a_clock)?;
                let prices = OraclePrices {
                    configs: &configs,
                    oracles: &accounts[3..],
                    now_slot: now,
                };

                let bank = zc::bank_mut(&mut data)?;
                let from_idx = registered(bank, a_from.key)?;
                bank.transfer_shares(&prices, from_idx, to, market, shares as u128, now)
                    .map_err(map_ledger_error)?;
                events::transfer(a_from.key, to, shares as u128);
            }
            Instruction::EnterMarket { market } => {
                accounts::expect_len(accounts, 2)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let bank = zc::bank_mut(&mut data)?;
                let idx = registered(bank, a_user.key)?;
                let newly_entered = bank.enter_market(idx, market).map_err(map_ledger_error)?;
                if newly_entered {
                    events::market_entered(market, a_user.key);
                }
            }
            Instruction::ExitMarket { market } => {
                accounts::expect_len(accounts, 3)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let configs = state::read_all_configs(&data);

                let now = clock_slot(a_clock)?;
                let prices = OraclePrices {
                    configs: &configs,
                    oracles: &accounts[3..],
                    now_slot: now,
                };

                let bank = zc::bank_mut(&mut data)?;
                let idx = registered(bank, a_user.key)?;
                bank.exit_market(&prices, idx, market, now)
                    .map_err(map_ledger_error)?;
                events::market_exited(market, a_user.key);
            }
            Instruction::AccrueInterest { market } => {
                accounts::expect_len(accounts, 2)?;
                let a_slab = &accounts[0];
                let a_clock = &accounts[1];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let now = clock_slot(a_clock)?;
                let bank = zc::bank_mut(&mut data)?;
                let outcome = bank.accrue_market(market, now).map_err(map_ledger_error)?;
                events::accrue_interest(
                    outcome.cash_prior,
                    outcome.interest_accumulated,
                    outcome.borrow_index,
                    outcome.total_borrows,
                );
            }
            Instruction::AddReserves { market, amount } => {
                accounts::expect_len(accounts, 6)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_user_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];
                let a_clock = &accounts[5];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                check_market(market)?;
                let config = state::read_config(&data, market);
                verify_market_vault(program_id, a_slab.key, a_vault, &config)?;

                let now = clock_slot(a_clock)?;
                let received = deposit_measured(a_token, a_user_ata, a_vault, a_user, amount)?;

                let bank = zc::bank_mut(&mut data)?;
                bank.add_reserves(market, received as u128, now)
                    .map_err(map_ledger_error)?;
            }
            Instruction::ReduceReserves { market, amount } => {
                accounts::expect_len(accounts, 7)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_dest_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                check_market(market)?;
                let config = state::read_config(&data, market);
                verify_market_vault(program_id, a_slab.key, a_vault, &config)?;

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;

                let now = clock_slot(a_clock)?;
                {
                    let bank = zc::bank_mut(&mut data)?;
                    bank.reduce_reserves(a_admin.key.to_bytes(), market, amount as u128, now)
                        .map_err(map_ledger_error)?;
                }

                withdraw_from_vault(
                    a_token,
                    a_vault,
                    a_dest_ata,
                    a_vault_pda,
                    a_slab.key,
                    config.vault_authority_bump,
                    amount,
                )?;
            }
            Instruction::SetReserveFactor { market, mantissa } => {
                let (a_admin, mut data, now) = admin_market_preamble(program_id, accounts)?;
                let bank = zc::bank_mut(&mut data)?;
                bank.set_reserve_factor(a_admin, market, mantissa, now)
                    .map_err(map_ledger_error)?;
            }
            Instruction::SetRateParams { market, base_rate, multiplier } => {
                let (a_admin, mut data, now) = admin_market_preamble(program_id, accounts)?;
                let bank = zc::bank_mut(&mut data)?;
                bank.set_rate_params(a_admin, market, base_rate, multiplier, now)
                    .map_err(map_ledger_error)?;
            }
            Instruction::SetCloseFactor { mantissa } => {
                let (a_admin, mut data, _) = admin_market_preamble(program_id, accounts)?;
                let bank = zc::bank_mut(&mut data)?;
                bank.controller
                    .set_close_factor(a_admin, mantissa)
                    .map_err(map_ledger_error)?;
            }
            Instruction::SetLiquidationIncentive { mantissa } => {
                let (a_admin, mut data, _) = admin_market_preamble(program_id, accounts)?;
                let bank = zc::bank_mut(&mut data)?;
                bank.controller
                    .set_liquidation_incentive(a_admin, mantissa)
                    .map_err(map_ledger_error)?;
            }
            Instruction::SetCollateralFactor { market, mantissa } => {
                let (a_admin, mut data, now) = admin_market_preamble(program_id, accounts)?;
                let configs = state::read_all_configs(&data);
                let prices = OraclePrices {
                    configs: &configs,
                    oracles: &accounts[3..],
                    now_slot: now,
                };
                let bank = zc::bank_mut(&mut data)?;
                let old_mantissa = bank
                    .controller
                    .collateral_factor
                    .get(market as usize)
                    .map(|v| v.get())
                    .unwrap_or(0);
                bank.controller
                    .set_collateral_factor(a_admin, &prices, market, mantissa)
                    .map_err(map_ledger_error)?;
                events::new_collateral_factor(market, old_mantissa, mantissa);
            }
            Instruction::SetMaxAssets { max_assets } => {
                let (a_admin, mut data, _) = admin_market_preamble(program_id, accounts)?;
                let bank = zc::bank_mut(&mut data)?;
                bank.controller
                    .set_max_assets(a_admin, max_assets)
                    .map_err(map_ledger_error)?;
            }
            Instruction::SetPauseGuardian { guardian } => {
                let (a_admin, mut data, _) = admin_market_preamble(program_id, accounts)?;
                let bank = zc::bank_mut(&mut data)?;
                bank.controller
                    .set_pause_guardian(a_admin, guardian.to_bytes())
                    .map_err(map_ledger_error)?;
            }
            Instruction::FlagMarket { market } => {
                accounts::expect_len(accounts, 3)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let now = clock_slot(a_clock)?;
                let deposit = {
                    let mut data = state::slab_data_mut(a_slab)?;
                    slab_guard(program_id, a_slab, &data)?;
                    require_initialized(&data)?;
                    let bank = zc::bank_mut(&mut data)?;
                    cast_u64(bank.controller.params.user_pause_deposit.get())?
                };

                bond::collect(a_user, a_slab, deposit)?;

                let mut data = state::slab_data_mut(a_slab)?;
                let bank = zc::bank_mut(&mut data)?;
                bank.flag_market(a_user.key.to_bytes(), market, deposit as u128, now)
                    .map_err(map_ledger_error)?;
                events::pool_paused(market, a_user.key, deposit);
            }
            Instruction::GuardianReject { market } => {
                accounts::expect_len(accounts, 3)?;
                let a_guardian = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_guardian)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let now = clock_slot(a_clock)?;
                let bank = zc::bank_mut(&mut data)?;
                bank.guardian_reject(a_guardian.key.to_bytes(), market, now)
                    .map_err(map_ledger_error)?;
                events::pool_unpaused(market);
            }
            Instruction::HarvestUnusedReward { market } => {
                accounts::expect_len(accounts, 3)?;
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                let now = clock_slot(a_clock)?;
                let bank = zc::bank_mut(&mut data)?;
                let amount = bank
                    .harvest_unused_reward(market, now)
                    .map_err(map_ledger_error)?;
                events::unfreeze_pool_amount(market, amount);
            }
            Instruction::ClaimModerationReward { market } => {
                accounts::expect_len(accounts, 3)?;
                let a_claimer = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_claimer)?;
                accounts::expect_writable(a_slab)?;

                let now = clock_slot(a_clock)?;
                let amount = {
                    let mut data = state::slab_data_mut(a_slab)?;
                    slab_guard(program_id, a_slab, &data)?;
                    require_initialized(&data)?;
                    let bank = zc::bank_mut(&mut data)?;
                    cast_u64(
                        bank.claim_moderation_reward(a_claimer.key.to_bytes(), market, now)
                            .map_err(map_ledger_error)?,
                    )?
                };

                bond::payout(a_slab, a_claimer, amount)?;
                events::unfreeze_pool_amount(market, amount as u128);
            }
            Instruction::SweepModerationFees => {
                accounts::expect_len(accounts, 2)?;
                let a_slab = &accounts[0];
                let a_fee_sink = &accounts[1];

                accounts::expect_writable(a_slab)?;

                let amount = {
                    let mut data = state::slab_data_mut(a_slab)?;
                    slab_guard(program_id, a_slab, &data)?;
                    require_initialized(&data)?;
                    let header = state::read_header(&data);
                    if a_fee_sink.key.to_bytes() != header.fee_sink {
                        return Err(AlembicError::InvalidFeeSink.into());
                    }
                    let bank = zc::bank_mut(&mut data)?;
                    cast_u64(bank.controller.take_pending_sweep())?
                };

                bond::payout(a_slab, a_fee_sink, amount)?;
                msg!("sweep_moderation_fees: amount={}", amount);
            }
        }
        Ok(())
    }

    /// Shared body of RedeemShares and RedeemUnderlying. `request` is shares
    /// or underlying depending on `by_shares`; the vault pays out whatever
    /// the ledger computed.
    fn process_redeem<'a>(
        program_id: &Pubkey,
        accounts: &[AccountInfo<'a>],
        market: u16,
        request: u64,
        by_shares: bool,
    ) -> ProgramResult {
        accounts::expect_len(accounts, 7)?;
        let a_user = &accounts[0];
        let a_slab = &accounts[1];
        let a_vault = &accounts[2];
        let a_user_ata = &accounts[3];
        let a_vault_pda = &accounts[4];
        let a_token = &accounts[5];
        let a_clock = &accounts[6];

        accounts::expect_signer(a_user)?;
        accounts::expect_writable(a_slab)?;

        let mut data = state::slab_data_mut(a_slab)?;
        slab_guard(program_id, a_slab, &data)?;
        require_initialized(&data)?;
        check_market(market)?;
        let configs = state::read_all_configs(&data);
        let config = &configs[market as usize];
        verify_market_vault(program_id, a_slab.key, a_vault, config)?;

        let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
        accounts::expect_key(a_vault_pda, &auth)?;

        let now = clock_slot(a_clock)?;
        let prices = OraclePrices {
            configs: &configs,
            oracles: &accounts[7..],
            now_slot: now,
        };

        let outcome = {
            let bank = zc::bank_mut(&mut data)?;
            let idx = registered(bank, a_user.key)?;
            if by_shares {
                bank.redeem_shares(&prices, idx, market, request as u128, now)
            } else {
                bank.redeem_underlying(&prices, idx, market, request as u128, now)
            }
            .map_err(map_ledger_error)?
        };

        let amount_out = cast_u64(outcome.redeem_amount)?;
        withdraw_from_vault(
            a_token,
            a_vault,
            a_user_ata,
            a_vault_pda,
            a_slab.key,
            config.vault_authority_bump,
            amount_out,
        )?;
        events::redeem(a_user.key, outcome.redeem_amount, outcome.redeem_shares);
        Ok(())
    }

    /// Shared body of Repay and RepayOnBehalf. With no explicit borrower the
    /// payer repays their own debt; `u64::MAX` repays the exact accrued
    /// balance.
    fn process_repay<'a>(
        program_id: &Pubkey,
        accounts: &[AccountInfo<'a>],
        market: u16,
        borrower: Option<u16>,
        amount: u64,
    ) -> ProgramResult {
        accounts::expect_len(accounts, 6)?;
        let a_payer = &accounts[0];
        let a_slab = &accounts[1];
        let a_payer_ata = &accounts[2];
        let a_vault = &accounts[3];
        let a_token = &accounts[4];
        let a_clock = &accounts[5];

        accounts::expect_signer(a_payer)?;
        accounts::expect_writable(a_slab)?;

        let mut data = state::slab_data_mut(a_slab)?;
        slab_guard(program_id, a_slab, &data)?;
        require_initialized(&data)?;
        check_market(market)?;
        let config = state::read_config(&data, market);
        verify_market_vault(program_id, a_slab.key, a_vault, &config)?;

        let now = clock_slot(a_clock)?;

        // Resolve the debtor and the full-repay sentinel against a freshly
        // accrued balance before any tokens move.
        let (borrower_idx, requested) = {
            let bank = zc::bank_mut(&mut data)?;
            let borrower_idx = match borrower {
                Some(idx) => {
                    check_idx(bank, idx)?;
                    idx
                }
                None => registered(bank, a_payer.key)?,
            };
            bank.accrue_market(market, now).map_err(map_ledger_error)?;
            let requested = if amount == REPAY_MAX {
                cast_u64(
                    bank.markets[market as usize]
                        .borrow_balance_stored(borrower_idx)
                        .map_err(map_ledger_error)?,
                )?
            } else {
                amount
            };
            (borrower_idx, requested)
        };

        let received = deposit_measured(a_token, a_payer_ata, a_vault, a_payer, requested)?;

        let bank = zc::bank_mut(&mut data)?;
        let outcome = bank
            .repay(borrower_idx, market, received as u128, now)
            .map_err(map_ledger_error)?;
        events::repay_borrow(
            a_payer.key,
            borrower_idx,
            outcome.repay_amount,
            outcome.account_borrows,
            outcome.total_borrows,
        );
        Ok(())
    }

    /// Shared [admin(signer), slab(writable), clock] prefix of the admin
    /// instructions. Returns the admin key bytes, the borrowed slab data and
    /// the current slot; authorization itself happens in the ledger.
    fn admin_market_preamble<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
    ) -> Result<([u8; 32], core::cell::RefMut<'b, &'a mut [u8]>, u64), ProgramError> {
        accounts::expect_len(accounts, 3)?;
        let a_admin = &accounts[0];
        let a_slab = &accounts[1];
        let a_clock = &accounts[2];

        accounts::expect_signer(a_admin)?;
        accounts::expect_writable(a_slab)?;

        let data = state::slab_data_mut(a_slab)?;
        slab_guard(program_id, a_slab, &data)?;
        require_initialized(&data)?;
        let now = clock_slot(a_clock)?;
        Ok((a_admin.key.to_bytes(), data, now))
    }
}

// 12. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use crate::processor;
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}

// 13. mod ledger (glue)
pub mod ledger {
    pub use alembic::{
        Bank, LedgerError, LinearRateModel, MarketView, MathSub, PriceSource, RiskParams,
        EXP_SCALE, MAX_ACCOUNTS, MAX_ENTERED, MAX_MARKETS,
    };
}
