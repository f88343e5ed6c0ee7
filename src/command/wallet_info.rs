use crate::wallet::Wallet;

pub fn wallet_info<C>(wallet: &Wallet<C>) -> String {
    format!("Wallet address: {}", wallet.address())
}
