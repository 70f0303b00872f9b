//! Python scripts run in the sandbox.
//!
//! Generated code is placed between a phase preamble (loads data, sets up
//! variables) and an epilogue (prints the phase's JSON result as the last
//! line). Run inputs reach the script through environment variables, never
//! through the script text.

use std::time::Duration;

use crate::sandbox::ExecutionRequest;
use crate::state::RunState;

pub const ENV_DATA_PATH: &str = "ML_FORGE_DATA_PATH";
pub const ENV_DATA_FORMAT: &str = "ML_FORGE_DATA_FORMAT";
pub const ENV_TARGET_COLUMN: &str = "ML_FORGE_TARGET_COLUMN";
pub const ENV_TASK_TYPE: &str = "ML_FORGE_TASK_TYPE";

pub const PROFILE_TIMEOUT: Duration = Duration::from_secs(120);
pub const FEATURE_TIMEOUT: Duration = Duration::from_secs(120);
pub const VISUALIZATION_TIMEOUT: Duration = Duration::from_secs(120);
pub const TRAINING_TIMEOUT: Duration = Duration::from_secs(300);
pub const EVALUATION_TIMEOUT: Duration = Duration::from_secs(120);

const COMMON_PREAMBLE: &str = r#"import os
import json
import warnings
warnings.filterwarnings('ignore')
import numpy as np
import pandas as pd

WORKING_DIR = os.getcwd()
DATA_PATH = os.environ['ML_FORGE_DATA_PATH']
DATA_FORMAT = os.environ.get('ML_FORGE_DATA_FORMAT', 'csv')
ENGINEERED_PATH = os.path.join(WORKING_DIR, 'df_engineered.csv')


def load_raw():
    readers = {'csv': pd.read_csv, 'parquet': pd.read_parquet, 'json': pd.read_json}
    return readers.get(DATA_FORMAT, pd.read_csv)(DATA_PATH)


def load_latest():
    if os.path.exists(ENGINEERED_PATH):
        return pd.read_csv(ENGINEERED_PATH)
    return load_raw()

"#;

const PROFILE_BODY: &str = r#"df = load_raw()

shape = [int(n) for n in df.shape]
dtypes = df.dtypes.astype(str).to_dict()
missing_counts = {str(k): int(v) for k, v in df.isnull().sum().items()}
total = max(len(df), 1)
missing_pct = {str(k): round(float(v) / total * 100, 2) for k, v in df.isnull().sum().items()}

numeric_cols = df.select_dtypes(include=[np.number]).columns.tolist()
numeric_stats = {}
if numeric_cols:
    desc = df[numeric_cols].describe().to_dict()
    numeric_stats = {str(col): {k: round(float(v), 4) for k, v in stats.items()} for col, stats in desc.items()}

cat_cols = df.select_dtypes(include=['object', 'category', 'bool']).columns.tolist()
categorical_stats = {}
for col in cat_cols:
    counts = df[col].value_counts().head(20).to_dict()
    categorical_stats[str(col)] = {str(k): int(v) for k, v in counts.items()}

correlation_top = []
if len(numeric_cols) > 1:
    corr = df[numeric_cols].corr()
    pairs = []
    for i in range(len(corr.columns)):
        for j in range(i + 1, len(corr.columns)):
            pairs.append({'col_a': str(corr.columns[i]), 'col_b': str(corr.columns[j]), 'correlation': round(float(corr.iloc[i, j]), 4)})
    correlation_top = sorted(pairs, key=lambda p: abs(p['correlation']), reverse=True)[:15]

target_candidates = ['target', 'label', 'class', 'y', 'outcome', 'is_', 'has_']
target_column = None
for col in df.columns:
    lowered = str(col).lower()
    if any(lowered == t or lowered.startswith(t) for t in target_candidates):
        target_column = str(col)
        break
if target_column is None and len(df.columns) > 0:
    target_column = str(df.columns[-1])

task_type = 'unknown'
if target_column in df.columns:
    target_dtype = str(df[target_column].dtype)
    if target_dtype in ['object', 'bool', 'category'] or df[target_column].nunique() <= 20:
        task_type = 'classification'
    else:
        task_type = 'regression'

print(json.dumps({
    'shape': shape,
    'dtypes': dtypes,
    'missing_counts': missing_counts,
    'missing_pct': missing_pct,
    'numeric_stats': numeric_stats,
    'categorical_stats': categorical_stats,
    'correlation_top': correlation_top,
    'target_column': target_column,
    'task_type': task_type,
}, default=str))
"#;

const FEATURE_PREAMBLE: &str = r#"df = load_raw()
original_columns = list(df.columns)

"#;

const FEATURE_EPILOGUE: &str = r#"

new_columns = [str(c) for c in df_engineered.columns if c not in original_columns]
dropped_columns = [str(c) for c in original_columns if c not in df_engineered.columns]
df_engineered.to_csv(ENGINEERED_PATH, index=False)

print(json.dumps({
    'new_columns': new_columns,
    'dropped_columns': dropped_columns,
    'new_shape': [int(n) for n in df_engineered.shape],
    'new_dtypes': df_engineered.dtypes.astype(str).to_dict(),
    'null_counts': {str(k): int(v) for k, v in df_engineered.isnull().sum().items()},
}, default=str))
"#;

const VISUALIZATION_PREAMBLE: &str = r#"import glob
import matplotlib
matplotlib.use('Agg')
import matplotlib.pyplot as plt
import seaborn as sns

_BG = '#1a1b2e'
_FG = '#e0e1f0'
_GRID = '#2a2b44'
_ACCENT_PALETTE = ['#7c3aed', '#06b6d4', '#f59e0b', '#ef4444', '#10b981', '#ec4899', '#3b82f6', '#8b5cf6']

sns.set_theme(style='darkgrid', context='notebook', palette=_ACCENT_PALETTE, rc={
    'figure.facecolor': _BG,
    'axes.facecolor': '#12132a',
    'axes.edgecolor': _GRID,
    'axes.labelcolor': _FG,
    'grid.color': _GRID,
    'grid.alpha': 0.4,
    'text.color': _FG,
    'xtick.color': _FG,
    'ytick.color': _FG,
    'legend.facecolor': _BG,
    'savefig.facecolor': _BG,
    'font.size': 11,
    'axes.titlesize': 13,
    'axes.titleweight': 'bold',
})

df = load_latest()
plot_dir = os.path.join(WORKING_DIR, 'plots')
os.makedirs(plot_dir, exist_ok=True)
print(f"Data loaded: {df.shape}, saving plots to: {plot_dir}")

"#;

const VISUALIZATION_EPILOGUE: &str = r#"

plot_files = sorted(glob.glob(os.path.join(plot_dir, '*.png')))
if not plot_files:
    plot_files = sorted(glob.glob(os.path.join(WORKING_DIR, '*.png')))
print(json.dumps({'plot_files': plot_files, 'plot_count': len(plot_files)}))
"#;

const TRAINING_PREAMBLE: &str = r#"import joblib
from sklearn.model_selection import train_test_split, cross_val_score

df = load_latest()
target_column = os.environ.get('ML_FORGE_TARGET_COLUMN', 'target')
task_type = os.environ.get('ML_FORGE_TASK_TYPE', 'unknown')
feature_columns = [c for c in df.columns if c != target_column]

X = df[feature_columns].copy()
y = df[target_column]
for col in X.select_dtypes(include=['object', 'category']).columns:
    X[col] = pd.Categorical(X[col]).codes

stratify = y if task_type == 'classification' and y.nunique() <= 50 else None
X_train, X_test, y_train, y_test = train_test_split(X, y, test_size=0.2, random_state=42, stratify=stratify)

X_test.to_csv(os.path.join(WORKING_DIR, 'X_test.csv'), index=False)
y_test.to_csv(os.path.join(WORKING_DIR, 'y_test.csv'), index=False)
X_train.to_csv(os.path.join(WORKING_DIR, 'X_train.csv'), index=False)
y_train.to_csv(os.path.join(WORKING_DIR, 'y_train.csv'), index=False)
print(f"Data loaded: X_train={X_train.shape}, X_test={X_test.shape}")

"#;

const EVALUATION_PREAMBLE: &str = r#"import joblib
import matplotlib
matplotlib.use('Agg')
import matplotlib.pyplot as plt

X_test = pd.read_csv(os.path.join(WORKING_DIR, 'X_test.csv'))
y_test = pd.read_csv(os.path.join(WORKING_DIR, 'y_test.csv')).iloc[:, 0]
X_train = pd.read_csv(os.path.join(WORKING_DIR, 'X_train.csv'))
y_train = pd.read_csv(os.path.join(WORKING_DIR, 'y_train.csv')).iloc[:, 0]

model_path = os.path.join(WORKING_DIR, 'best_model.joblib')
if not os.path.exists(model_path):
    print(json.dumps({'error': 'Model file not found'}))
    raise SystemExit(1)
best_model = joblib.load(model_path)

eval_dir = os.path.join(WORKING_DIR, 'eval_plots')
os.makedirs(eval_dir, exist_ok=True)
print(f"Model loaded: {type(best_model).__name__}, X_test: {X_test.shape}")

"#;

/// File the training code must write the chosen model to.
pub const MODEL_FILE: &str = "best_model.joblib";

/// The script kinds, one per code-running phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Profile,
    Features,
    Visualization,
    Training,
    Evaluation,
}

impl Script {
    /// Wraps generated code into a complete script. The profile script
    /// ignores `agent_code`.
    pub fn assemble(&self, agent_code: &str) -> String {
        let (preamble, epilogue) = match self {
            Script::Profile => return format!("{}{}", COMMON_PREAMBLE, PROFILE_BODY),
            Script::Features => (FEATURE_PREAMBLE, FEATURE_EPILOGUE),
            Script::Visualization => (VISUALIZATION_PREAMBLE, VISUALIZATION_EPILOGUE),
            Script::Training => (TRAINING_PREAMBLE, ""),
            Script::Evaluation => (EVALUATION_PREAMBLE, ""),
        };
        format!("{}{}{}\n{}", COMMON_PREAMBLE, preamble, agent_code, epilogue)
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Script::Profile => PROFILE_TIMEOUT,
            Script::Features => FEATURE_TIMEOUT,
            Script::Visualization => VISUALIZATION_TIMEOUT,
            Script::Training => TRAINING_TIMEOUT,
            Script::Evaluation => EVALUATION_TIMEOUT,
        }
    }

    /// A sandbox request for this script against the run's data.
    pub fn request(&self, state: &RunState, agent_code: &str) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(self.assemble(agent_code), &state.working_dir)
            .with_timeout(self.timeout())
            .with_env(ENV_DATA_PATH, &state.data_source.location)
            .with_env(ENV_DATA_FORMAT, state.data_source.format.as_str());
        if let Some(profile) = &state.data_profile {
            request = request
                .with_env(
                    ENV_TARGET_COLUMN,
                    profile.target_column.as_deref().unwrap_or("target"),
                )
                .with_env(ENV_TASK_TYPE, profile.task_type.to_string());
        }
        request
    }
}

/// Deterministic plots used when generated visualization code is unusable.
pub fn fallback_visualization(target_column: Option<&str>) -> String {
    let target = target_column.unwrap_or("target").replace(['\'', '\\', '\n'], "_");
    FALLBACK_VISUALIZATION.replace("__TARGET__", &target)
}

const FALLBACK_VISUALIZATION: &str = r#"numeric_cols = df.select_dtypes(include=[np.number]).columns.tolist()[:8]
target = '__TARGET__'

fig, ax = plt.subplots(figsize=(9, 6))
if target in df.columns:
    if df[target].nunique() <= 20:
        sns.countplot(data=df, x=target, ax=ax, alpha=0.85, order=df[target].value_counts().index[:15])
    else:
        sns.histplot(data=df, x=target, ax=ax, bins=30, alpha=0.8)
    ax.set_title('Target Distribution')
plt.tight_layout()
plt.savefig(os.path.join(plot_dir, 'plot_01_target_dist.png'), dpi=150, bbox_inches='tight')
plt.close('all')
print('Plot 1: Target variable distribution')

if len(numeric_cols) > 1:
    fig, ax = plt.subplots(figsize=(10, 8))
    corr = df[numeric_cols].corr()
    mask = np.triu(np.ones_like(corr, dtype=bool))
    sns.heatmap(corr, mask=mask, annot=True, fmt='.2f', cmap='RdBu_r', ax=ax, vmin=-1, vmax=1, linewidths=0.5)
    ax.set_title('Feature Correlation Matrix')
    plt.tight_layout()
    plt.savefig(os.path.join(plot_dir, 'plot_02_correlation.png'), dpi=150, bbox_inches='tight')
    plt.close('all')
    print('Plot 2: Correlation heatmap of numeric features')

if numeric_cols:
    n_cols = min(len(numeric_cols), 6)
    n_rows = (n_cols + 2) // 3
    fig, axes = plt.subplots(n_rows, 3, figsize=(14, 4 * n_rows))
    axes = np.atleast_2d(axes).flatten()
    for i in range(n_cols):
        sns.histplot(data=df, x=numeric_cols[i], ax=axes[i], kde=True, alpha=0.7, bins=30)
        axes[i].set_title(numeric_cols[i])
    for i in range(n_cols, len(axes)):
        axes[i].set_visible(False)
    plt.tight_layout()
    plt.savefig(os.path.join(plot_dir, 'plot_03_distributions.png'), dpi=150, bbox_inches='tight')
    plt.close('all')
    print('Plot 3: Distribution of numeric features')

if len(numeric_cols) >= 2:
    fig, ax = plt.subplots(figsize=(9, 6))
    if target in df.columns and df[target].nunique() <= 10:
        sns.scatterplot(data=df, x=numeric_cols[0], y=numeric_cols[1], hue=target, ax=ax, alpha=0.6, s=40)
    else:
        sns.scatterplot(data=df, x=numeric_cols[0], y=numeric_cols[1], ax=ax, alpha=0.5, s=30)
    ax.set_title(str(numeric_cols[0]) + ' vs ' + str(numeric_cols[1]))
    plt.tight_layout()
    plt.savefig(os.path.join(plot_dir, 'plot_04_feature_scatter.png'), dpi=150, bbox_inches='tight')
    plt.close('all')
    print('Plot 4: Feature scatter plot')
"#;
