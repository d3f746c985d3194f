// ABOUTME: emits a json schema for the privileged service request type to stdout.
// ABOUTME: intended for clients written against blockerd without linking blocker-common.

fn main() -> Result<(), serde_json::Error> {
    let schema = schemars::schema_for!(blocker_common::ServiceRequest);
    let json = serde_json::to_string_pretty(&schema)?;
    println!("{json}");
    Ok(())
}
