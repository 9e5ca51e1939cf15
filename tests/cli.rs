use std::fs;
use std::process::Command;

use tempfile::tempdir;

const SPLIT: &str = "time\tevent\tmin_bid\tmax_bid\tfeatures\n\
1.0\t0\t\t1.5\t0:1\n\
2.0\t1\t1.0\t\t1:1\n\
3.0\t0\t\t\t2:1 0:0.5\n\
4.0\t1\t2.0\t\t1:1\n";

#[test]
fn train_subcommand_writes_checkpoint() {
    let tmp = tempdir().expect("temporary directory");
    let mut paths = Vec::new();
    for name in ["train.tsv", "validation.tsv", "test.tsv"] {
        let path = tmp.path().join(name);
        fs::write(&path, SPLIT).expect("write split");
        paths.push(path);
    }
    let config_path = tmp.path().join("config.toml");
    fs::write(
        &config_path,
        "learning_rate = 0.01\nlambda_adxwon = 0.5\n\n[distribution]\nfamily = \"weibull\"\nshape = 1.5\n",
    )
    .expect("write config");
    let output_dir = tmp.path().join("out");

    let exe = env!("CARGO_BIN_EXE_bidsurv");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "train",
            "--train",
            paths[0].to_str().expect("path str"),
            "--validation",
            paths[1].to_str().expect("path str"),
            "--test",
            paths[2].to_str().expect("path str"),
            "--num-features",
            "3",
            "--config",
            config_path.to_str().expect("path str"),
            "--output-dir",
            output_dir.to_str().expect("path str"),
            "--epochs",
            "2",
            "--batch-size",
            "2",
            "--k",
            "2",
        ])
        .status()
        .expect("run bidsurv cli");

    assert!(status.success(), "CLI exited with status {status:?}");
    let snapshot = fs::read_to_string(output_dir.join("params_k2.toml")).expect("snapshot");
    assert!(snapshot.contains("distribution_name = \"weibull\""));
    assert!(output_dir.join("predictions_validation.csv").exists());
    assert!(output_dir.join("predictions_test.csv").exists());
}

#[test]
fn feature_index_beyond_width_fails() {
    let tmp = tempdir().expect("temporary directory");
    let path = tmp.path().join("split.tsv");
    fs::write(&path, SPLIT).expect("write split");
    let path = path.to_str().expect("path str");

    let status = Command::new(env!("CARGO_BIN_EXE_bidsurv"))
        .current_dir(tmp.path())
        .args([
            "train",
            "--train",
            path,
            "--validation",
            path,
            "--test",
            path,
            "--num-features",
            "2",
        ])
        .status()
        .expect("run bidsurv cli");
    assert!(!status.success());
}
