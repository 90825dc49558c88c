mod common;

use common::{Reply, ScriptedConnection, init_tracing};
use http::Method;
use multicloud_storage::{
    AzureBlobsDriver, ByteSource, Container, Metadata, Object, StorageDriver, StorageError,
    TransferConfig, UploadOptions,
    drivers::azure::{API_VERSION, AZURE_DRIVER_NAME, block_id},
    transfer::{chunks::exhaust, hashing::content_md5},
};
use std::time::Duration;

const CHUNK: usize = 8;

fn config() -> TransferConfig {
    TransferConfig::default()
        .with_min_part_size(4)
        .with_chunk_size(CHUNK)
        .with_lease_period(Duration::from_secs(15))
}

fn container(name: &str) -> Container {
    Container::new(name, Metadata::new(), AZURE_DRIVER_NAME)
}

#[tokio::test]
async fn block_upload_holds_a_lease_and_commits_in_order() {
    init_tracing();
    let conn = ScriptedConnection::new([
        Reply::status(201).header("x-ms-lease-id", "lease-1"),
        Reply::status(201),
        Reply::status(201),
        Reply::status(201),
        Reply::status(201).header("etag", "\"0x8D\""),
        Reply::status(200),
    ]);
    let azure = AzureBlobsDriver::new(conn.clone(), config()).unwrap();
    let payload = b"0123456789abcdef!".to_vec();

    let object = azure
        .upload_object_via_stream(
            ByteSource::from_bytes(payload.clone()),
            &container("backups"),
            "db/dump.sql",
            UploadOptions::new().with_meta("Source", "nightly"),
        )
        .await
        .unwrap();
    assert_eq!(object.size, payload.len() as u64);
    assert_eq!(object.etag(), Some("\"0x8D\""));
    assert_eq!(conn.remaining(), 0);

    let requests = conn.requests();
    assert!(requests.iter().all(|r| r.header("x-ms-version") == Some(API_VERSION)));

    let acquire = &requests[0];
    assert_eq!(acquire.param("comp"), Some("lease"));
    assert_eq!(acquire.header("x-ms-lease-action"), Some("acquire"));
    assert_eq!(acquire.header("x-ms-lease-duration"), Some("15"));

    let blocks: Vec<_> = requests.iter().filter(|r| r.param("comp") == Some("block")).collect();
    assert_eq!(blocks.len(), 3);
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.param("blockid"), Some(block_id(i as u32 + 1).as_str()));
        assert_eq!(block.header("x-ms-lease-id"), Some("lease-1"));
        assert_eq!(block.header("content-md5"), Some(content_md5(&block.body).as_str()));
    }
    assert_eq!(blocks[2].body.as_ref(), b"!");

    let commit = &requests[4];
    assert_eq!(commit.param("comp"), Some("blocklist"));
    let manifest = String::from_utf8(commit.body.to_vec()).unwrap();
    let expected: String = (1..=3).map(|n| format!("<Latest>{}</Latest>", block_id(n))).collect();
    assert!(manifest.contains(&format!("<BlockList>{}</BlockList>", expected)));
    assert_eq!(commit.header("x-ms-blob-content-md5"), Some(content_md5(&payload).as_str()));
    assert_eq!(commit.header("x-ms-blob-content-type"), Some("application/octet-stream"));
    assert_eq!(commit.header("x-ms-meta-source"), Some("nightly"));
    assert_eq!(commit.header("x-ms-lease-id"), Some("lease-1"));

    let release = requests.last().unwrap();
    assert_eq!(release.header("x-ms-lease-action"), Some("release"));
}

#[tokio::test]
async fn missing_blob_means_no_lease() {
    let conn = ScriptedConnection::new([
        Reply::status(404),
        Reply::status(201),
        Reply::status(201),
    ]);
    let azure = AzureBlobsDriver::new(conn.clone(), config()).unwrap();

    azure
        .upload_object_via_stream(
            ByteSource::from_bytes("fresh"),
            &container("backups"),
            "new.txt",
            UploadOptions::new(),
        )
        .await
        .unwrap();

    let requests = conn.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1..].iter().all(|r| r.header("x-ms-lease-id").is_none()));
}

#[tokio::test]
async fn failed_block_releases_the_lease() {
    let conn = ScriptedConnection::new([
        Reply::status(201).header("x-ms-lease-id", "lease-9"),
        Reply::status(500).body("ServerBusy"),
        Reply::status(200),
    ]);
    let azure = AzureBlobsDriver::new(conn.clone(), config()).unwrap();

    let err = azure
        .upload_object_via_stream(
            ByteSource::from_bytes(vec![0u8; 3 * CHUNK]),
            &container("backups"),
            "big.bin",
            UploadOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::UnexpectedResponse { status: 500, ref body } if body == "ServerBusy"
    ));

    let requests = conn.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.param("comp") != Some("blocklist")));
    assert_eq!(requests[2].header("x-ms-lease-action"), Some("release"));
    assert_eq!(requests[2].header("x-ms-lease-id"), Some("lease-9"));
}

#[tokio::test]
async fn block_checksum_mismatch_aborts() {
    let conn = ScriptedConnection::new([
        Reply::status(201).header("content-md5", content_md5(b"something else")),
    ]);
    let azure = AzureBlobsDriver::new(conn.clone(), TransferConfig::default()).unwrap();

    let err = azure
        .upload_object_via_stream(
            ByteSource::from_bytes("payload"),
            &container("backups"),
            "x.bin",
            UploadOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ObjectHashMismatch { .. }));
    // No lease configured, so aborting sends nothing.
    assert_eq!(conn.requests().len(), 1);
}

#[tokio::test]
async fn block_checksum_is_skipped_when_verification_is_off() {
    let conn = ScriptedConnection::new([
        Reply::status(201).header("content-md5", content_md5(b"something else")),
        Reply::status(201).header("etag", "\"0x9A\""),
    ]);
    let azure = AzureBlobsDriver::new(conn.clone(), TransferConfig::default()).unwrap();

    let object = azure
        .upload_object_via_stream(
            ByteSource::from_bytes("payload"),
            &container("backups"),
            "x.bin",
            UploadOptions::new().with_verify_hash(false),
        )
        .await
        .unwrap();
    assert_eq!(object.size, 7);
    assert_eq!(object.etag(), Some("\"0x9A\""));

    let requests = conn.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].param("comp"), Some("blocklist"));
}

#[tokio::test]
async fn non_empty_container_is_not_deleted() {
    let listing = "<EnumerationResults><Blobs><Blob><Name>a.txt</Name><Properties>\
                   <Content-Length>3</Content-Length></Properties></Blob></Blobs>\
                   <NextMarker /></EnumerationResults>";
    let conn = ScriptedConnection::new([Reply::status(200).body(listing)]);
    let azure = AzureBlobsDriver::new(conn.clone(), TransferConfig::default()).unwrap();

    let err = azure.delete_container(&container("full")).await.unwrap_err();
    assert!(matches!(err, StorageError::ContainerIsNotEmpty(_)));

    let requests = conn.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::GET);
    assert_eq!(requests[0].param("maxresults"), Some("1"));
}

#[tokio::test]
async fn empty_container_is_deleted() {
    let conn = ScriptedConnection::new([
        Reply::status(200).body("<EnumerationResults><Blobs /></EnumerationResults>"),
        Reply::status(202),
    ]);
    let azure = AzureBlobsDriver::new(conn.clone(), TransferConfig::default()).unwrap();

    assert!(azure.delete_container(&container("empty")).await.unwrap());
    assert_eq!(conn.requests()[1].method, Method::DELETE);
}

#[tokio::test]
async fn listing_reads_properties_and_metadata() {
    let page_one = "<EnumerationResults><Blobs>\
        <Blob><Name>a.txt</Name><Properties><Content-Length>3</Content-Length>\
        <Content-MD5>kAFQmDzST7DWlj99KOF/cg==</Content-MD5><Content-Type>text/plain</Content-Type>\
        </Properties><Metadata><owner>ops</owner></Metadata></Blob>\
        </Blobs><NextMarker>m1</NextMarker></EnumerationResults>";
    let page_two = "<EnumerationResults><Blobs>\
        <Blob><Name>b.txt</Name><Properties><Content-Length>0</Content-Length></Properties></Blob>\
        </Blobs><NextMarker /></EnumerationResults>";
    let conn = ScriptedConnection::new([
        Reply::status(200).body(page_one),
        Reply::status(200).body(page_two),
    ]);
    let azure = AzureBlobsDriver::new(conn.clone(), TransferConfig::default()).unwrap();

    let objects = azure.list_container_objects(&container("docs")).await.unwrap();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0].hash, "900150983cd24fb0d6963f7d28e17f72");
    assert_eq!(objects[0].content_type(), Some("text/plain"));
    assert_eq!(objects[0].meta_data.get("owner"), Some("ops"));
    assert_eq!(objects[1].size, 0);
    assert_eq!(conn.requests()[1].param("marker"), Some("m1"));
}

#[tokio::test]
async fn range_requests_use_the_ms_header() {
    let conn = ScriptedConnection::new([Reply::status(206).body("56789")]);
    let azure = AzureBlobsDriver::new(conn.clone(), TransferConfig::default()).unwrap();
    let object = Object::new(
        "digits",
        19,
        "",
        Metadata::new(),
        Metadata::new(),
        &container("data"),
    );

    let stream = azure
        .download_object_range_as_stream(&object, 5, Some(9), None)
        .await
        .unwrap();
    assert_eq!(exhaust(stream).await.unwrap().as_ref(), b"56789");
    assert_eq!(conn.requests()[0].header("x-ms-range"), Some("bytes=5-9"));
}

#[tokio::test]
async fn unsatisfiable_range_is_reported() {
    let conn = ScriptedConnection::new([Reply::status(416)]);
    let azure = AzureBlobsDriver::new(conn, TransferConfig::default()).unwrap();
    let object = Object::new("x", 10, "", Metadata::new(), Metadata::new(), &container("data"));

    let result = azure.download_object_range_as_stream(&object, 2, None, None).await;
    assert!(matches!(result, Err(StorageError::InvalidRange(_))));
}

#[tokio::test]
async fn head_converts_content_md5_to_hex() {
    let conn = ScriptedConnection::new([Reply::status(200)
        .header("content-length", "3")
        .header("content-md5", "kAFQmDzST7DWlj99KOF/cg==")
        .header("x-ms-meta-color", "blue")
        .header("x-ms-blob-type", "BlockBlob")]);
    let azure = AzureBlobsDriver::new(conn, TransferConfig::default()).unwrap();

    let object = azure.get_object("docs", "abc.txt").await.unwrap();
    assert_eq!(object.size, 3);
    assert_eq!(object.hash, "900150983cd24fb0d6963f7d28e17f72");
    assert_eq!(object.meta_data.get("color"), Some("blue"));
    assert_eq!(object.extra.get("blob_type"), Some("BlockBlob"));
    assert_eq!(object.driver, AZURE_DRIVER_NAME);
}

#[tokio::test]
async fn create_container_maps_conflicts() {
    let conn = ScriptedConnection::new([Reply::status(201), Reply::status(409)]);
    let azure = AzureBlobsDriver::new(conn, TransferConfig::default()).unwrap();

    azure.create_container("images").await.unwrap();
    let err = azure.create_container("images").await.unwrap_err();
    assert!(matches!(err, StorageError::ContainerAlreadyExists(_)));
    let err = azure.create_container("bad--name").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidContainerName { .. }));
}
