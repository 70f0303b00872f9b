//! Prompts for the phase handlers.
//!
//! Templates are rendered with `tera`; every variable is inserted as plain
//! text.

use tera::{Context, Tera};

use crate::error::GraphError;

/// System prompt for code generation.
pub const SYSTEM_ML_ENGINEER: &str = "You are an expert ML engineer. You write clean, production-grade Python code \
using pandas, scikit-learn, xgboost, and lightgbm. You reason carefully about data quality, feature leakage, \
and model selection. You prefer simple, interpretable solutions unless complexity is justified by the data.

CRITICAL RULES:
- Return ONLY executable Python code: no markdown, no explanations, no ```python fences
- NEVER import data or load files; data is ALREADY loaded into variables for you
- NEVER create directories or manage file paths; the environment handles this
- Use ONLY the pre-loaded variables described in the prompt
- Keep ALL string literals on a SINGLE LINE; never break a string across lines
- Use simple concatenation ('a' + 'b') if needed, never backslash continuation in strings";

/// System prompt for plain-text analysis.
pub const SYSTEM_ML_ANALYST: &str = "You are an expert ML engineer and data scientist. You analyze data profiles, \
model results, and pipeline outputs. You provide clear, specific, actionable analysis in plain text. \
You are direct and avoid generic advice.

CRITICAL RULES:
- Return ONLY plain text analysis; never return code
- Do NOT wrap your response in markdown code blocks
- Be specific to the data provided";

/// System prompt for the critic.
pub const SYSTEM_CRITIC: &str = "You are a senior ML reviewer. You evaluate ML pipeline decisions for correctness, \
methodology soundness, potential data leakage, overfitting risk, and alignment with the stated objectives. \
You are direct and specific in your feedback.";

pub const DATA_PROFILE_ANALYSIS: &str = r#"Analyze this dataset profile and provide key findings.

**User Objective**: {{ objective }}

**Dataset Shape**: {{ shape }}
**Column Types**: {{ dtypes }}
**Missing Values**: {{ missing_counts }}
**Numeric Summary**: {{ numeric_stats }}
**Categorical Summary**: {{ categorical_stats }}

Provide a concise analysis covering:
1. Data quality issues (nulls, anomalies, potential errors)
2. Feature candidates for the stated objective
3. Potential data leakage risks
4. Recommended preprocessing steps

Be specific to this dataset."#;

pub const FEATURE_ENGINEERING_CODE: &str = r#"Generate Python code to engineer features for this ML task.

**User Objective**: {{ objective }}
**Data Profile Summary**: {{ profile_summary }}
**Column Names & Types**: {{ dtypes }}
**Current Shape**: {{ shape }}
{% if critic_feedback %}
{{ critic_feedback }}
{% endif %}
ALREADY AVAILABLE (do NOT re-create or re-load):
- `df`: the full DataFrame is already loaded in memory

Requirements:
- Use pandas DataFrame operations on the existing `df` variable
- Create meaningful derived features aligned with the objective
- Handle missing values appropriately
- Encode categoricals if needed (label encoding or one-hot)
- Do NOT include model training, only feature engineering
- Store the final engineered DataFrame as `df_engineered`
- Print the new column names and shape at the end

FORBIDDEN:
- Do NOT use pd.read_csv() or any file loading
- Do NOT import os, pathlib, or do any file system operations

Return ONLY executable Python code, no explanations, no markdown fences."#;

pub const FEATURE_VALIDATION: &str = r#"Review these engineered features for quality and leakage risk.

**User Objective**: {{ objective }}
**Original Columns**: {{ original_columns }}
**New Features Created**: {{ new_features }}
**Feature Code**:
```python
{{ feature_code }}
```

Check for:
1. Target leakage: does any feature use information from the target?
2. Data leakage: does any feature use future information?
3. Redundant features: high correlation with existing columns?
4. Quality: are there NaN-generating operations?"#;

pub const VISUALIZATION_CODE: &str = r#"Generate Python visualization code for exploratory data analysis.

**User Objective**: {{ objective }}
**Column Names & Types**: {{ dtypes }}
**Shape**: {{ shape }}
**Key Findings from Profiling**: {{ key_findings }}

ALREADY AVAILABLE (do NOT re-create or re-load):
- `df`: the full DataFrame is already loaded
- `plot_dir`: string path to save plots (already created)
- `plt` is matplotlib.pyplot, `sns` is seaborn, `np` and `pd` are imported
- A dark theme is already configured

Requirements:
- Create 3-5 informative seaborn plots targeting the objective
- Save each plot: plt.savefig(plot_dir + '/plot_01_name.png', dpi=150, bbox_inches='tight')
- Call plt.close('all') after each save
- Print a one-line description of each plot
- Keep all string literals on a SINGLE LINE

FORBIDDEN:
- Do NOT use pd.read_csv() or any file loading
- Do NOT import os or create directories
- Do NOT use plt.show()
- Do NOT call sns.set_theme(), plt.style.use() or set_facecolor()

Return ONLY executable Python code, no markdown fences."#;

pub const VISUALIZATION_INTERPRETATION: &str = r#"Interpret these EDA visualizations for the ML pipeline.

**User Objective**: {{ objective }}
**Plots Generated**:
{{ plot_descriptions }}

Based on the visualizations, provide:
1. Key patterns discovered
2. Feature engineering suggestions from visual patterns
3. Potential modeling challenges (class imbalance, non-linearity, etc.)
4. Recommended model families based on data characteristics

Be specific and actionable."#;

pub const MODEL_SELECTION_CODE: &str = r#"Generate Python code to train and evaluate ML models.

**User Objective**: {{ objective }}
**Task Type**: {{ task_type }}
**Target Column**: {{ target_column }}
**Feature Columns**: {{ feature_columns }}
**Shape**: {{ shape }}
**Key Insights**: {{ key_insights }}
{% if critic_feedback %}
{{ critic_feedback }}
{% endif %}
ALREADY AVAILABLE (do NOT re-create or re-load):
- `X_train`, `X_test`: feature DataFrames (already split, already numeric-encoded)
- `y_train`, `y_test`: target Series (already split)
- `pd`, `np`, `json`, `joblib`, `cross_val_score` are imported

Requirements:
- Train at least 3 model candidates with reasonable default hyperparameters
- Use 5-fold cross-validation on the training set
- For classification: compute accuracy, f1_macro, precision, recall
- For regression: compute RMSE, MAE, R2
- Pick the best model by cross-validation score
- Save the final best model: joblib.dump(best_model, 'best_model.joblib')
- Print a SINGLE JSON line at the end with this structure:
  {"best_model": "ModelName", "candidates": [{"name": "ModelName", "accuracy": 0.85, "precision": 0.82, "recall": 0.80, "f1": 0.81, "cv_mean": 0.83, "cv_std": 0.02, "train_score": 0.88}], "best_hyperparams": {}, "feature_importance": {}, "train_score": 0.0, "test_score": 0.0}
- For regression candidates use r2 for accuracy and set precision, recall and f1 to null

FORBIDDEN:
- Do NOT use pd.read_csv() or load any files
- Do NOT call train_test_split
- Do NOT import os or pathlib, or create directories

Return ONLY executable Python code, no markdown fences."#;

pub const EVALUATION_CODE: &str = r#"Generate Python code for thorough model evaluation.

**User Objective**: {{ objective }}
**Task Type**: {{ task_type }}
**Best Model**: {{ best_model_name }}
**Training Metrics**: {{ training_metrics }}

ALREADY AVAILABLE (do NOT re-create or re-load):
- `best_model`: the trained model
- `X_test`, `y_test`, `X_train`, `y_train`: already loaded
- `pd`, `np`, `json`, `plt` are imported
- `eval_dir`: string path for evaluation plots (already created)

Requirements:
- Generate a classification report or regression metrics
- Create a confusion matrix plot (classification) or residual plot (regression)
- Save plots to eval_dir + '/eval_plot_name.png' with dpi=100 and bbox_inches='tight'
- Call plt.close('all') after each plot
- Compute the train vs test score gap
- Print a SINGLE JSON line at the end:
  {"cv_scores": [], "cv_mean": 0.0, "cv_std": 0.0, "test_metrics": {}, "train_score": 0.0, "test_score": 0.0, "plot_paths": []}

FORBIDDEN:
- Do NOT use joblib.load() or pd.read_csv()
- Do NOT import os or manage directories
- Do NOT use plt.show()

Return ONLY executable Python code, no markdown fences."#;

pub const EVALUATION_SUMMARY: &str = r#"Summarize these model evaluation results in 3-4 sentences. Focus on model quality, overfitting risk, and whether it meets the objective: {{ objective }}

Metrics: {{ metrics }}"#;

pub const CRITIC_REVIEW: &str = r#"Review the complete ML pipeline and decide whether to finalize or loop back.

**User Objective**: {{ objective }}

**Pipeline Summary**:
- Data Profile: {{ profile_summary }}
- Features Engineered: {{ features_summary }}
- Visualization Insights: {{ viz_insights }}
- Model Trained: {{ model_summary }}
- Evaluation Metrics: {{ eval_metrics }}
- Errors Encountered: {{ errors }}

**Loop History**: Iteration {{ iteration }}/{{ max_loops }}
**Previous Critic Decisions**: {{ previous_decisions }}

Evaluate:
1. Does the model adequately address the user's objective?
2. Are there signs of overfitting or data leakage?
3. Were feature engineering choices sound?
4. Is model performance acceptable, or could we do better?
5. Were there errors that need correction?

Set overall_assessment to one of "finalize", "refine_features" or "retrain_model"."#;

/// Asks for a fix to code that failed in the sandbox.
pub const CODE_REPAIR: &str = r#"The following {{ what }} failed:
```python
{{ code }}
```
Error: {{ stderr }}

{% if reminder %}IMPORTANT: {{ reminder }}
{% endif %}Fix the code. Return ONLY corrected executable Python code, no markdown."#;

/// Renders one of the templates above.
pub fn render(template: &str, context: &Context) -> Result<String, GraphError> {
    Ok(Tera::one_off(template, context, false)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_render() {
        let mut context = Context::new();
        for key in [
            "objective", "shape", "dtypes", "missing_counts", "numeric_stats", "categorical_stats",
            "profile_summary", "original_columns", "new_features", "feature_code", "key_findings",
            "plot_descriptions", "task_type", "target_column", "feature_columns", "key_insights",
            "best_model_name", "training_metrics", "metrics", "features_summary", "viz_insights",
            "model_summary", "eval_metrics", "errors", "iteration", "max_loops",
            "previous_decisions", "what", "code", "stderr", "reminder", "critic_feedback",
        ] {
            context.insert(key, "X");
        }
        for template in [
            DATA_PROFILE_ANALYSIS,
            FEATURE_ENGINEERING_CODE,
            FEATURE_VALIDATION,
            VISUALIZATION_CODE,
            VISUALIZATION_INTERPRETATION,
            MODEL_SELECTION_CODE,
            EVALUATION_CODE,
            EVALUATION_SUMMARY,
            CRITIC_REVIEW,
            CODE_REPAIR,
        ] {
            let rendered = render(template, &context).unwrap();
            assert!(!rendered.contains("{{"));
        }
    }

    #[test]
    fn test_optional_sections() {
        let mut context = Context::new();
        context.insert("what", "training code");
        context.insert("code", "x = 1");
        context.insert("stderr", "NameError: y");
        context.insert("reminder", "");
        let rendered = render(CODE_REPAIR, &context).unwrap();
        assert!(rendered.starts_with("The following training code failed:"));
        assert!(!rendered.contains("IMPORTANT"));

        context.insert("reminder", "X_train is loaded.");
        assert!(render(CODE_REPAIR, &context).unwrap().contains("IMPORTANT: X_train is loaded."));
    }

    #[test]
    fn test_values_are_not_escaped() {
        let mut context = Context::new();
        context.insert("metrics", r#"{"f1": 0.8, "note": "<b>"}"#);
        context.insert("objective", "a & b");
        let rendered = render(EVALUATION_SUMMARY, &context).unwrap();
        assert!(rendered.contains(r#"{"f1": 0.8, "note": "<b>"}"#));
        assert!(rendered.contains("a & b"));
    }
}
