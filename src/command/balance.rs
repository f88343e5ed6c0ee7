use crate::{chain::AddressHistory, wallet::Wallet};

pub async fn balance<C>(wallet: &Wallet<C>) -> anyhow::Result<String>
where
    C: AddressHistory + Send + Sync,
{
    let amount = wallet
        .balance()
        .await
        .map(|amount| amount.to_string())
        .unwrap_or_else(|e| format!("Problem encountered: {:#}", e));

    Ok(format!("Balance: {}", amount))
}
