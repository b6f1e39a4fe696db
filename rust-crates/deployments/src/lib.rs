use anyhow::{
    Context,
    Result,
    anyhow,
};
use chrono::{
    DateTime,
    Utc,
};
use escrow_core::{
    Address,
    ContractSnapshot,
    TokenAmount,
    chain::{
        DeployRequest,
        Deployment,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    fs,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
};

pub const DEPLOYMENTS_ROOT: &str = ".deployments";
const ESCROWS_FILE: &str = "escrows.json";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeploymentEnv {
    Polygon,
    Amoy,
    Local,
}

impl DeploymentEnv {
    pub fn dir_name(self) -> &'static str {
        match self {
            DeploymentEnv::Polygon => "polygon",
            DeploymentEnv::Amoy => "amoy",
            DeploymentEnv::Local => "local",
        }
    }

    pub fn chain_id(self) -> u64 {
        match self {
            DeploymentEnv::Polygon => 137,
            DeploymentEnv::Amoy => 80_002,
            DeploymentEnv::Local => 31_337,
        }
    }
}

impl fmt::Display for DeploymentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentEnv::Polygon => "Polygon",
            DeploymentEnv::Amoy => "Polygon Amoy",
            DeploymentEnv::Local => "Local",
        };
        write!(f, "{name}")
    }
}

impl FromStr for DeploymentEnv {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "polygon" | "mainnet" => Ok(DeploymentEnv::Polygon),
            "amoy" | "testnet" => Ok(DeploymentEnv::Amoy),
            "local" => Ok(DeploymentEnv::Local),
            other => Err(anyhow!("unknown network {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Deployed,
    Opened,
}

/// One escrow this client deployed or opened on a network.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub recorded_at: DateTime<Utc>,
    pub contract_address: Address,
    pub origin: RecordOrigin,
    pub payer: Address,
    pub payee: Address,
    pub amount: TokenAmount,
    pub milestone_percentages: Vec<u8>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

impl EscrowRecord {
    pub fn deployed(request: &DeployRequest, deployment: &Deployment) -> Self {
        Self {
            recorded_at: Utc::now(),
            contract_address: deployment.contract_address,
            origin: RecordOrigin::Deployed,
            payer: request.payer,
            payee: request.payee,
            amount: request.amount,
            milestone_percentages: request.milestone_percentages.clone(),
            duration_secs: Some(request.duration_secs),
            tx_hash: Some(deployment.tx_hash.to_string()),
        }
    }

    pub fn opened(contract_address: Address, snapshot: &ContractSnapshot) -> Self {
        Self {
            recorded_at: Utc::now(),
            contract_address,
            origin: RecordOrigin::Opened,
            payer: snapshot.payer,
            payee: snapshot.payee,
            amount: snapshot.amount,
            milestone_percentages: snapshot.milestones.iter().map(|m| m.percentage).collect(),
            duration_secs: None,
            tx_hash: None,
        }
    }
}

#[derive(Debug)]
pub struct DeploymentStore {
    path: PathBuf,
}

impl DeploymentStore {
    pub fn new(env: DeploymentEnv) -> Result<Self> {
        Self::in_dir(DEPLOYMENTS_ROOT, env)
    }

    pub fn in_dir(root: impl AsRef<Path>, env: DeploymentEnv) -> Result<Self> {
        let path = ensure_store(root.as_ref(), env)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Oldest first.
    pub fn load_all(&self) -> Result<Vec<EscrowRecord>> {
        read_records(&self.path)
    }

    pub fn latest(&self) -> Result<Option<EscrowRecord>> {
        Ok(self.load_all()?.pop())
    }

    /// Upserts by contract address; the recorded escrow becomes the latest.
    pub fn record(&self, record: EscrowRecord) -> Result<()> {
        let mut records = self.load_all()?;
        records.retain(|existing| existing.contract_address != record.contract_address);
        records.push(record);
        write_records(&self.path, &records)
    }
}

fn ensure_store(root: &Path, env: DeploymentEnv) -> Result<PathBuf> {
    let env_dir = root.join(env.dir_name());
    if !env_dir.exists() {
        fs::create_dir_all(&env_dir).with_context(|| {
            format!("Failed to create {} directory", env_dir.display())
        })?;
    }

    let file_path = env_dir.join(ESCROWS_FILE);
    if !file_path.exists() {
        fs::write(&file_path, b"").with_context(|| {
            format!(
                "Failed to create escrow record file for {} at {:?}",
                env, file_path
            )
        })?;
    }

    Ok(file_path)
}

fn read_records(path: impl AsRef<Path>) -> Result<Vec<EscrowRecord>> {
    let data = fs::read(path.as_ref()).context("Failed to read escrow records")?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    if let Ok(records) = serde_json::from_slice::<Vec<EscrowRecord>>(&data) {
        return Ok(records);
    }
    if let Ok(record) = serde_json::from_slice::<EscrowRecord>(&data) {
        return Ok(vec![record]);
    }
    Err(anyhow!(
        "Failed to parse escrow records JSON; expected a list of escrow objects"
    ))
}

fn write_records(path: impl AsRef<Path>, records: &[EscrowRecord]) -> Result<()> {
    let json =
        serde_json::to_vec_pretty(records).context("Failed to serialize escrow records")?;
    fs::write(path.as_ref(), json).context("Failed to write escrow records")?;
    Ok(())
}
