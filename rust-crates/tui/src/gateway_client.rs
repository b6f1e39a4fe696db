use color_eyre::eyre::{
    Result,
    WrapErr,
};
use escrow_core::{
    Address,
    ContractSnapshot,
    TokenAmount,
    chain::{
        ChainError,
        ContractCall,
        ContractReader,
        DeployRequest,
        EscrowGateway,
        TxHash,
        TxReceipt,
        WalletProvider,
    },
    wallet::WalletSession,
};
use reqwest::{
    RequestBuilder,
    StatusCode,
};
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};
use url::Url;

/// JSON client of the wallet/contract gateway. The gateway holds the signer;
/// every write goes through it.
#[derive(Clone, Debug)]
pub struct GatewayClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChainIdDto {
    chain_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SwitchedDto {
    switched: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct TxHashDto {
    tx_hash: TxHash,
}

#[derive(Debug, Serialize, Deserialize)]
struct AmountDto {
    amount: TokenAmount,
}

#[derive(Debug, Serialize)]
struct SubmitDto<'a> {
    from: &'a Address,
    #[serde(flatten)]
    call: &'a ContractCall,
}

#[derive(Debug, Serialize)]
struct ApproveDto<'a> {
    owner: &'a Address,
    spender: &'a Address,
    amount: TokenAmount,
}

impl GatewayClient {
    pub fn new(base_url: &Url) -> Result<Self> {
        let base_url = base_url.as_str().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .build()
            .wrap_err("failed to build HTTP client for gateway")?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, ChainError> {
        let res = request
            .send()
            .await
            .map_err(|e| ChainError::new(None, format!("gateway request failed: {e}")))?;
        let status = res.status();
        let bytes = res.bytes().await.map_err(|e| {
            ChainError::new(None, format!("failed to read gateway response body: {e}"))
        })?;
        if !status.is_success() {
            return Err(rejection(status, &bytes));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| ChainError::new(None, format!("invalid {what} payload: {e}")))
    }
}

/// Error bodies are provider errors `{code, message}`; anything else is
/// reported with the status line.
fn rejection(status: StatusCode, body: &[u8]) -> ChainError {
    serde_json::from_slice::<ChainError>(body).unwrap_or_else(|_| {
        let body = String::from_utf8_lossy(body);
        ChainError::new(None, format!("gateway responded with {status}: {body}"))
    })
}

impl ContractReader for GatewayClient {
    async fn contract_details(&self, contract: &Address) -> Result<ContractSnapshot, ChainError> {
        let request = self.http.get(self.url(&format!("/escrow/{contract}")));
        self.fetch(request, "contract snapshot").await
    }
}

impl EscrowGateway for GatewayClient {
    async fn submit(
        &self,
        contract: &Address,
        from: &Address,
        call: &ContractCall,
    ) -> Result<TxHash, ChainError> {
        let request = self
            .http
            .post(self.url(&format!("/escrow/{contract}/tx")))
            .json(&SubmitDto { from, call });
        let dto: TxHashDto = self.fetch(request, call.method()).await?;
        Ok(dto.tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: &TxHash,
        confirmations: u64,
    ) -> Result<TxReceipt, ChainError> {
        let request = self
            .http
            .get(self.url(&format!("/tx/{tx_hash}/receipt")))
            .query(&[("confirmations", confirmations)]);
        self.fetch(request, "receipt").await
    }

    async fn deploy(&self, request: &DeployRequest) -> Result<TxHash, ChainError> {
        let request = self.http.post(self.url("/escrow/deploy")).json(request);
        let dto: TxHashDto = self.fetch(request, "deployment").await?;
        Ok(dto.tx_hash)
    }

    async fn token_balance(
        &self,
        token: &Address,
        owner: &Address,
    ) -> Result<TokenAmount, ChainError> {
        let request = self
            .http
            .get(self.url(&format!("/token/{token}/balance/{owner}")));
        let dto: AmountDto = self.fetch(request, "balance").await?;
        Ok(dto.amount)
    }

    async fn token_allowance(
        &self,
        token: &Address,
        owner: &Address,
        spender: &Address,
    ) -> Result<TokenAmount, ChainError> {
        let request = self
            .http
            .get(self.url(&format!("/token/{token}/allowance/{owner}/{spender}")));
        let dto: AmountDto = self.fetch(request, "allowance").await?;
        Ok(dto.amount)
    }

    async fn approve_token(
        &self,
        token: &Address,
        owner: &Address,
        spender: &Address,
        amount: TokenAmount,
    ) -> Result<TxHash, ChainError> {
        let request = self
            .http
            .post(self.url(&format!("/token/{token}/approve")))
            .json(&ApproveDto {
                owner,
                spender,
                amount,
            });
        let dto: TxHashDto = self.fetch(request, "approval").await?;
        Ok(dto.tx_hash)
    }
}

impl WalletProvider for GatewayClient {
    async fn connect(&self) -> Result<WalletSession, ChainError> {
        let request = self.http.post(self.url("/wallet/connect"));
        self.fetch(request, "wallet session").await
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        let request = self.http.get(self.url("/wallet/network"));
        let dto: ChainIdDto = self.fetch(request, "network").await?;
        Ok(dto.chain_id)
    }

    async fn switch_network(&self, chain_id: u64) -> Result<bool, ChainError> {
        let request = self
            .http
            .post(self.url("/wallet/switch"))
            .json(&ChainIdDto { chain_id });
        let dto: SwitchedDto = self.fetch(request, "network switch").await?;
        Ok(dto.switched)
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{
        App,
        HttpResponse,
        HttpServer,
        dev::ServerHandle,
        web,
    };
    use escrow_core::test_helpers::{
        ALICE,
        ESCROW,
        funded_snapshot,
    };
    use serde_json::json;
    use std::{
        net::TcpListener,
        sync::{
            Arc,
            Mutex,
        },
        thread::JoinHandle,
    };

    type Seen = Arc<Mutex<Vec<serde_json::Value>>>;

    /// Canned gateway on a random local port. Request bodies are recorded.
    struct StubGateway {
        base_url: Url,
        seen: Seen,
        server_handle: ServerHandle,
        server_thread: Option<JoinHandle<()>>,
    }

    impl StubGateway {
        fn start() -> Self {
            let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            let address = listener.local_addr().unwrap();
            let base_url = Url::parse(&format!("http://{address}/")).unwrap();
            let seen = Seen::default();

            let app_seen = seen.clone();
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(app_seen.clone()))
                    .route("/wallet/connect", web::post().to(handle_connect))
                    .route("/wallet/switch", web::post().to(handle_switch))
                    .route("/escrow/{address}", web::get().to(handle_snapshot))
                    .route("/escrow/{address}/tx", web::post().to(handle_submit))
                    .route("/tx/{hash}/receipt", web::get().to(handle_receipt))
                    .route(
                        "/token/{token}/balance/{owner}",
                        web::get().to(handle_balance),
                    )
            })
            .workers(1)
            .listen(listener)
            .unwrap()
            .run();

            let server_handle = server.handle();
            let server_thread = std::thread::spawn(move || {
                let sys = actix_web::rt::System::new();
                let _ = sys.block_on(server);
            });

            Self {
                base_url,
                seen,
                server_handle,
                server_thread: Some(server_thread),
            }
        }

        fn client(&self) -> GatewayClient {
            GatewayClient::new(&self.base_url).unwrap()
        }

        fn seen(&self) -> Vec<serde_json::Value> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Drop for StubGateway {
        fn drop(&mut self) {
            let _ = self.server_handle.stop(true);
            if let Some(thread) = self.server_thread.take() {
                let _ = thread.join();
            }
        }
    }

    async fn handle_connect() -> HttpResponse {
        HttpResponse::Ok().json(json!({ "address": ALICE, "chain_id": 137 }))
    }

    async fn handle_switch() -> HttpResponse {
        HttpResponse::BadRequest().json(json!({
            "code": 4001,
            "message": "User rejected the request."
        }))
    }

    async fn handle_snapshot(address: web::Path<String>) -> HttpResponse {
        if address.as_str() == ESCROW.to_string() {
            HttpResponse::Ok().json(funded_snapshot(&[50, 50]))
        } else {
            HttpResponse::NotFound().body("no such escrow")
        }
    }

    async fn handle_submit(seen: web::Data<Seen>, body: web::Json<serde_json::Value>) -> HttpResponse {
        seen.lock().unwrap().push(body.into_inner());
        HttpResponse::Ok().json(json!({ "tx_hash": "0xabc" }))
    }

    async fn handle_receipt(
        hash: web::Path<String>,
        query: web::Query<std::collections::HashMap<String, String>>,
    ) -> HttpResponse {
        let confirmations = query.get("confirmations").cloned().unwrap_or_default();
        HttpResponse::Ok().json(json!({
            "tx_hash": hash.into_inner(),
            "block_number": 7,
            "success": confirmations == "2",
            "revert_reason": "wrong confirmation count",
        }))
    }

    async fn handle_balance() -> HttpResponse {
        HttpResponse::Ok().json(json!({ "amount": "not a number" }))
    }

    #[tokio::test]
    async fn contract_details__known_escrow__decodes_snapshot() {
        // given
        let stub = StubGateway::start();
        let client = stub.client();

        // when
        let snapshot = client.contract_details(&ESCROW).await.unwrap();

        // then
        assert_eq!(snapshot, funded_snapshot(&[50, 50]));
    }

    #[tokio::test]
    async fn contract_details__unknown_escrow__reports_status() {
        // given
        let stub = StubGateway::start();
        let client = stub.client();

        // when
        let err = client.contract_details(&ALICE).await.unwrap_err();

        // then
        assert_eq!(err.code, None);
        assert!(err.message.contains("404"), "{}", err.message);
        assert!(err.message.contains("no such escrow"));
    }

    #[tokio::test]
    async fn submit__sends_sender_and_tagged_call() {
        // given
        let stub = StubGateway::start();
        let client = stub.client();
        let call = ContractCall::Deposit {
            amount: TokenAmount::whole_tokens(5),
        };

        // when
        let tx_hash = client.submit(&ESCROW, &ALICE, &call).await.unwrap();

        // then
        assert_eq!(tx_hash, TxHash("0xabc".to_string()));
        assert_eq!(
            stub.seen(),
            vec![json!({
                "from": ALICE.to_string(),
                "method": "deposit",
                "amount": 5_000_000,
            })]
        );
    }

    #[tokio::test]
    async fn wait_for_receipt__passes_confirmations() {
        // given
        let stub = StubGateway::start();
        let client = stub.client();
        let tx_hash = TxHash("0xabc".to_string());

        // when
        let receipt = client.wait_for_receipt(&tx_hash, 2).await.unwrap();

        // then
        assert!(receipt.success);
        assert_eq!(receipt.tx_hash, tx_hash);
        assert_eq!(receipt.block_number, 7);
    }

    #[tokio::test]
    async fn switch_network__provider_error_body__keeps_code() {
        // given
        let stub = StubGateway::start();
        let client = stub.client();

        // when
        let err = client.switch_network(137).await.unwrap_err();

        // then
        assert!(err.is_user_rejection());
        assert_eq!(err.message, "User rejected the request.");
    }

    #[tokio::test]
    async fn connect__returns_session() {
        // given
        let stub = StubGateway::start();
        let client = stub.client();

        // when
        let session = client.connect().await.unwrap();

        // then
        assert_eq!(session.address, ALICE);
        assert_eq!(session.chain_id, 137);
    }

    #[tokio::test]
    async fn token_balance__malformed_payload__is_a_read_error() {
        // given
        let stub = StubGateway::start();
        let client = stub.client();

        // when
        let err = client.token_balance(&ESCROW, &ALICE).await.unwrap_err();

        // then
        assert!(err.message.starts_with("invalid balance payload"), "{}", err.message);
    }

    #[test]
    fn new__trims_trailing_slash() {
        let url = Url::parse("http://localhost:8545/").unwrap();
        let client = GatewayClient::new(&url).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8545");
    }
}
