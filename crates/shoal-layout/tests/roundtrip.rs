//! Generated layouts written to disk read back identical.

use shoal_domain::catalog;
use shoal_inventory::{load_snapshot, LoaderOptions, MemoryInventory};
use shoal_layout::{generate_from_hardware, read_hardware_config, DesiredLayout};

const HW: &str = r#"
shards: 2
azs:
  - name: east-1a
    racks:
      - name: r01
        servers:
          - compute_id: cn1
            role: metadata
          - compute_id: cn2
            role: metadata
          - compute_id: cn3
            role: metadata
  - name: east-1b
    racks:
      - name: r11
        servers:
          - compute_id: cn4
            role: metadata
          - compute_id: cn5
            role: metadata
          - compute_id: cn6
            role: metadata
          - compute_id: cn7
            role: storage
"#;

#[tokio::test]
async fn written_layouts_read_back_identical() {
    let mut builder = MemoryInventory::builder();
    for svc in catalog::all() {
        builder = builder.service(svc).image(&format!("img-{}", svc), svc, "3.1.0");
    }
    let snap = load_snapshot(&builder.build(), &LoaderOptions::default())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let hw_path = dir.path().join("hardware.yml");
    std::fs::write(&hw_path, HW).unwrap();

    let config = read_hardware_config(&hw_path).unwrap();
    let generated = generate_from_hardware(&config, &snap).unwrap();

    let out = tempfile::tempdir().unwrap();
    let written = generated.write_all(out.path()).unwrap();
    assert_eq!(written.len(), 2);

    for (az, layout) in &generated.per_az {
        let path = out.path().join(format!("layout-{}.json", az));
        let read_back = DesiredLayout::read(&path).unwrap();
        assert_eq!(&read_back, layout, "az {}", az);
    }
}
